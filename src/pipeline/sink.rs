//! Output sinks for everything a filter step publishes.

use crate::filter::StepOutput;
use anyhow::Result;
use serde::Serialize;
use std::io::Write;

/// Where estimates, snapshots, and ground-truth pairings go.
pub trait EstimateSink: Send {
    fn publish(&mut self, output: &StepOutput) -> Result<()>;
}

/// Channel-tagged JSON line, mirroring the input envelope format.
#[derive(Serialize)]
struct OutEnvelope<'a, T: Serialize> {
    channel: &'static str,
    #[serde(flatten)]
    msg: &'a T,
}

// ============================================================================
// Stdout Sink
// ============================================================================

/// Writes one JSON line per published message to stdout.
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }

    fn write_line<T: Serialize>(channel: &'static str, msg: &T) -> Result<()> {
        let line = serde_json::to_string(&OutEnvelope { channel, msg })?;
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        lock.write_all(line.as_bytes())?;
        lock.write_all(b"\n")?;
        Ok(())
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EstimateSink for StdoutSink {
    fn publish(&mut self, output: &StepOutput) -> Result<()> {
        Self::write_line("CONTACT_FILTER_POINT_ESTIMATE", &output.estimate)?;
        if let Some(snapshot) = &output.snapshot {
            Self::write_line("CONTACT_PARTICLE_FILTER_DATA", snapshot)?;
        }
        if let Some(comparison) = &output.comparison {
            Self::write_line("ACTUAL_AND_ESTIMATED_CONTACT_LOCATIONS", comparison)?;
        }
        Ok(())
    }
}

// ============================================================================
// Memory Sink (tests)
// ============================================================================

/// Captures everything published, for assertions.
#[derive(Default)]
pub struct MemorySink {
    pub outputs: Vec<StepOutput>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EstimateSink for MemorySink {
    fn publish(&mut self, output: &StepOutput) -> Result<()> {
        self.outputs.push(output.clone());
        Ok(())
    }
}
