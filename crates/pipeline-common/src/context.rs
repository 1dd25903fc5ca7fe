//! Shared stream processing context.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cancellation::CancellationToken;

/// Context shared by every stage of a pipeline.
///
/// Carries the stream name (for logs), the cancellation token, and the TS
/// bitrate in bits per second as last sampled by the host I/O layer. A zero
/// bitrate means "unknown"; stages that need it keep their previous sample.
#[derive(Debug)]
pub struct StreamContext {
    pub name: String,
    pub token: CancellationToken,
    bitrate: AtomicU64,
}

impl StreamContext {
    pub fn new(token: CancellationToken) -> Self {
        StreamContext {
            name: "stream".to_string(),
            token,
            bitrate: AtomicU64::new(0),
        }
    }

    pub fn with_name(name: impl Into<String>, token: CancellationToken) -> Self {
        StreamContext {
            name: name.into(),
            ..Self::new(token)
        }
    }

    pub fn arc_new(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self::new(token))
    }

    /// Publish a bitrate sample, in bits per second.
    pub fn set_bitrate(&self, bits_per_second: u64) {
        self.bitrate.store(bits_per_second, Ordering::Relaxed);
    }

    /// Last published bitrate; zero when unknown.
    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Relaxed)
    }
}
