//! Unified message processing loop.
//!
//! One synchronous filter step per residual message, in arrival order;
//! other channels only update filter state between steps. Cancellation
//! takes effect between steps; a running step is never interrupted.

use super::sink::EstimateSink;
use super::source::{MessageSource, SourceEvent};
use crate::filter::ContactFilter;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Final counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub residuals_processed: u64,
    pub estimates_published: u64,
    pub sets_alive: usize,
}

/// Owns the filter and the sink for the duration of a run.
pub struct ProcessingLoop<S: EstimateSink> {
    filter: ContactFilter,
    sink: S,
    cancel_token: CancellationToken,
}

impl<S: EstimateSink> ProcessingLoop<S> {
    pub fn new(filter: ContactFilter, sink: S, cancel_token: CancellationToken) -> Self {
        Self {
            filter,
            sink,
            cancel_token,
        }
    }

    /// Run until the source is exhausted or cancellation fires.
    ///
    /// Solver failures inside a step are fatal and abort the run; that is
    /// the only error path out of the filter itself.
    pub async fn run<M: MessageSource>(mut self, source: &mut M) -> Result<(PipelineStats, S)> {
        let mut stats = PipelineStats::default();
        info!("processing residual stream from {}...", source.source_name());

        loop {
            let event = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("[ProcessingLoop] shutdown signal received");
                    break;
                }
                result = source.next_event() => {
                    match result {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("[ProcessingLoop] source error: {}", e);
                            break;
                        }
                    }
                }
            };

            match event {
                SourceEvent::Residual(msg) => {
                    stats.residuals_processed += 1;
                    let output = self
                        .filter
                        .on_residual(&msg)
                        .context("fatal filter error")?;
                    if let Some(output) = output {
                        self.sink.publish(&output)?;
                        stats.estimates_published += 1;
                    }
                }
                SourceEvent::RobotState(msg) => self.filter.on_robot_state(&msg),
                SourceEvent::ForceTorqueHint(msg) => self.filter.on_external_force_torque(&msg),
                SourceEvent::ContactLocation(msg) => self.filter.on_contact_location(&msg),
                SourceEvent::Eof => {
                    info!(
                        "[ProcessingLoop] source reached end ({} residuals processed)",
                        stats.residuals_processed
                    );
                    break;
                }
            }
        }

        stats.sets_alive = self.filter.sets().len();
        info!(
            residuals = stats.residuals_processed,
            estimates = stats.estimates_published,
            sets = stats.sets_alive,
            "pipeline finished"
        );
        Ok((stats, self.sink))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SurfaceCatalog;
    use crate::config::CpfConfig;
    use crate::locator::CatalogLocator;
    use crate::model::KinematicTree;
    use crate::pipeline::{Envelope, MemorySink, ReplaySource};
    use crate::types::ResidualState;
    use nalgebra::{Point3, Vector3};
    use std::sync::Arc;

    fn filter() -> ContactFilter {
        let model = KinematicTree::from_urdf_str(
            r#"<robot name="r">
                 <link name="base"/>
                 <link name="arm"/>
                 <joint name="j" type="revolute">
                   <origin xyz="0.3 0 0"/>
                   <axis xyz="0 0 1"/>
                   <parent link="base"/>
                   <child link="arm"/>
                 </joint>
               </robot>"#,
        )
        .expect("parse");
        let catalog = Arc::new(
            SurfaceCatalog::from_entries(
                [("arm", Point3::new(0.1, 0.02, 0.0), Vector3::y())],
                &model,
            )
            .expect("catalog"),
        );
        let locator = CatalogLocator::new(Arc::clone(&catalog));
        let mut filter = ContactFilter::new(
            Arc::new(CpfConfig::default()),
            Box::new(model),
            catalog,
            Box::new(locator),
        )
        .expect("filter");
        filter.start();
        filter
    }

    fn zero_residual(utime: u64) -> Envelope {
        Envelope::Residual(ResidualState {
            utime,
            joint_names: vec!["j".into()],
            residual: vec![0.0],
        })
    }

    #[tokio::test]
    async fn publishes_one_estimate_per_residual() {
        let events = (0..3).map(|i| zero_residual(i * 10_000)).collect();
        let mut source = ReplaySource::new(events, 0.0);
        let looper = ProcessingLoop::new(filter(), MemorySink::new(), CancellationToken::new());
        let (stats, sink) = looper.run(&mut source).await.expect("run");
        assert_eq!(stats.residuals_processed, 3);
        assert_eq!(stats.estimates_published, 3);
        assert_eq!(sink.outputs.len(), 3);
        assert!(sink
            .outputs
            .iter()
            .all(|o| o.estimate.num_contact_points == 0));
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_message() {
        let events = (0..100).map(|i| zero_residual(i * 10_000)).collect();
        let mut source = ReplaySource::new(events, 0.0);
        let token = CancellationToken::new();
        token.cancel();
        let looper = ProcessingLoop::new(filter(), MemorySink::new(), token);
        let (stats, _) = looper.run(&mut source).await.expect("run");
        assert_eq!(stats.residuals_processed, 0);
    }
}
