//! Message source abstraction for the filter's subscribed streams.
//!
//! Both sources speak the same channel-tagged JSON line format but handle
//! damage differently: the live stdin source probes each line's channel
//! tag before decoding, so a noisy upstream gets per-channel diagnostics
//! and a skip count instead of killing the filter, while the replay source
//! is strict (a recorded log is expected to be clean) and paces playback
//! from the `utime` deltas inside the messages themselves, consistent with
//! the filter's simulated-time model.

use crate::types::{ExternalForceTorque, MultipleContactLocations, ResidualState, RobotState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// One JSON line on the wire: the `channel` field selects the payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "channel")]
pub enum Envelope {
    #[serde(rename = "RESIDUAL_OBSERVER_STATE")]
    Residual(ResidualState),

    #[serde(rename = "EST_ROBOT_STATE")]
    RobotState(RobotState),

    #[serde(rename = "EXTERNAL_FORCE_TORQUE")]
    ForceTorque(ExternalForceTorque),

    #[serde(rename = "EXTERNAL_CONTACT_LOCATION")]
    ContactLocation(MultipleContactLocations),
}

/// Channels a conforming upstream may emit, in rename order above.
const KNOWN_CHANNELS: [&str; 4] = [
    "RESIDUAL_OBSERVER_STATE",
    "EST_ROBOT_STATE",
    "EXTERNAL_FORCE_TORQUE",
    "EXTERNAL_CONTACT_LOCATION",
];

/// Simulated timestamp of a message, when it carries one. The force-torque
/// hint is stateless and has none.
fn envelope_utime(envelope: &Envelope) -> Option<u64> {
    match envelope {
        Envelope::Residual(msg) => Some(msg.utime),
        Envelope::RobotState(msg) => Some(msg.utime),
        Envelope::ForceTorque(_) => None,
        Envelope::ContactLocation(msg) => Some(msg.utime),
    }
}

/// Why a line could not become an [`Envelope`].
#[derive(Debug, Error)]
enum EnvelopeError {
    #[error("not JSON: {0}")]
    NotJson(serde_json::Error),

    #[error("no 'channel' field")]
    MissingChannel,

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("bad '{channel}' payload: {source}")]
    BadPayload {
        channel: String,
        source: serde_json::Error,
    },
}

/// Decode one line, distinguishing an unknown channel from a known channel
/// with a malformed payload.
fn parse_envelope(line: &str) -> Result<Envelope, EnvelopeError> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(EnvelopeError::NotJson)?;
    let channel = match value.get("channel").and_then(serde_json::Value::as_str) {
        Some(channel) => channel.to_string(),
        None => return Err(EnvelopeError::MissingChannel),
    };
    if !KNOWN_CHANNELS.contains(&channel.as_str()) {
        return Err(EnvelopeError::UnknownChannel(channel));
    }
    serde_json::from_value(value).map_err(|source| EnvelopeError::BadPayload { channel, source })
}

/// Events produced by a message source.
pub enum SourceEvent {
    Residual(ResidualState),
    RobotState(RobotState),
    ForceTorqueHint(ExternalForceTorque),
    ContactLocation(MultipleContactLocations),
    /// Source reached end of data.
    Eof,
}

impl From<Envelope> for SourceEvent {
    fn from(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Residual(msg) => Self::Residual(msg),
            Envelope::RobotState(msg) => Self::RobotState(msg),
            Envelope::ForceTorque(msg) => Self::ForceTorqueHint(msg),
            Envelope::ContactLocation(msg) => Self::ContactLocation(msg),
        }
    }
}

/// Trait abstracting where filter input messages come from.
///
/// Implementations handle format decoding and pacing internally. The
/// processing loop calls [`next_event`](MessageSource::next_event) in a
/// select! with cancellation.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Read the next message from the source.
    ///
    /// Returns `SourceEvent::Eof` when no more data is available.
    async fn next_event(&mut self) -> Result<SourceEvent>;

    /// Human-readable name for logging (e.g. "stdin", "replay").
    fn source_name(&self) -> &str;
}

// ============================================================================
// Stdin Source (live piping)
// ============================================================================

/// Reads channel-tagged JSON messages from stdin.
///
/// Undecodable lines are dropped with a channel-aware diagnostic and
/// counted; an observer process that interleaves debug output with its
/// message stream cannot kill the filter, but the operator can see how
/// much of the stream was lost.
pub struct StdinSource {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>,
    line_number: u64,
    skipped: u64,
}

impl StdinSource {
    pub fn new() -> Self {
        use tokio::io::AsyncBufReadExt;
        Self {
            lines: tokio::io::BufReader::new(tokio::io::stdin()).lines(),
            line_number: 0,
            skipped: 0,
        }
    }

    /// Lines dropped so far because they did not decode.
    pub fn skipped_lines(&self) -> u64 {
        self.skipped
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSource for StdinSource {
    async fn next_event(&mut self) -> Result<SourceEvent> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_envelope(line) {
                Ok(envelope) => return Ok(envelope.into()),
                Err(reject) => {
                    self.skipped += 1;
                    warn!(
                        line = self.line_number,
                        skipped = self.skipped,
                        "dropping undecodable message: {reject}"
                    );
                }
            }
        }
        if self.skipped > 0 {
            info!(
                skipped = self.skipped,
                total = self.line_number,
                "stdin stream ended with undecodable lines dropped"
            );
        }
        Ok(SourceEvent::Eof)
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

// ============================================================================
// Replay Source (recorded logs)
// ============================================================================

/// Replays a recorded message log, paced by the simulated timestamps the
/// messages carry.
///
/// With `rate` = 1 the gap between consecutive timestamped messages is
/// reproduced in wall time; 2 replays twice as fast; 0 replays flat out.
/// Untimestamped messages (the force-torque hint) are delivered
/// immediately, exactly as they interleave in the log.
#[derive(Debug)]
pub struct ReplaySource {
    events: VecDeque<Envelope>,
    rate: f64,
    last_utime: Option<u64>,
}

impl ReplaySource {
    pub fn new(events: Vec<Envelope>, rate: f64) -> Self {
        Self {
            events: VecDeque::from(events),
            rate,
            last_utime: None,
        }
    }

    /// Load a JSON-lines log file. Unlike the live source, a replay log is
    /// expected to be clean: the first undecodable line is an error.
    pub fn from_path(path: &Path, rate: f64) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay log {}", path.display()))?;
        let mut events = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let envelope = parse_envelope(line).map_err(|e| {
                anyhow::anyhow!("{}:{}: {e}", path.display(), number + 1)
            })?;
            events.push(envelope);
        }
        Ok(Self::new(events, rate))
    }

    /// Wall-clock pause before delivering a message stamped `utime`.
    fn pacing_delay(&self, utime: u64) -> Option<Duration> {
        if self.rate <= 0.0 || !self.rate.is_finite() {
            return None;
        }
        let previous = self.last_utime?;
        let gap_us = utime.saturating_sub(previous) as f64 / self.rate;
        (gap_us >= 1.0).then(|| Duration::from_micros(gap_us as u64))
    }
}

#[async_trait]
impl MessageSource for ReplaySource {
    async fn next_event(&mut self) -> Result<SourceEvent> {
        let Some(envelope) = self.events.pop_front() else {
            return Ok(SourceEvent::Eof);
        };
        if let Some(utime) = envelope_utime(&envelope) {
            if let Some(delay) = self.pacing_delay(utime) {
                tokio::time::sleep(delay).await;
            }
            self.last_utime = Some(utime);
        }
        Ok(envelope.into())
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// Tests
// ============================================================================
