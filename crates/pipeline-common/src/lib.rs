//! # Pipeline Common
//!
//! Common abstractions for building transport stream processing pipelines:
//! a [`PacketProcessor`] trait for per-packet stages, a [`Pipeline`] runner
//! that drives packets from an input iterator through the stages to an
//! output sink, and a shared [`StreamContext`] carrying the cancellation
//! token and the host-sampled TS bitrate.

use thiserror::Error;

pub mod cancellation;
pub mod context;
pub mod pipeline;
pub mod processor;

pub use cancellation::CancellationToken;
pub use context::StreamContext;
pub use pipeline::Pipeline;
pub use processor::{PacketProcessor, PacketStatus};

/// Common error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("pipeline terminated by processor {0}")]
    Terminated(&'static str),
}
