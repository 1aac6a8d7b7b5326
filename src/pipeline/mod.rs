//! Message-driven pipeline around the filter.
//!
//! A [`MessageSource`] feeds channel-tagged JSON messages in arrival order;
//! the [`ProcessingLoop`] runs one synchronous filter step per residual and
//! hands everything the step publishes to an [`EstimateSink`].

mod processing_loop;
mod sink;
mod source;

pub use processing_loop::{PipelineStats, ProcessingLoop};
pub use sink::{EstimateSink, MemorySink, StdoutSink};
pub use source::{Envelope, MessageSource, ReplaySource, SourceEvent, StdinSource};
