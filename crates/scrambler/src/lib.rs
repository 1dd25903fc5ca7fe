//! DVB-CSA transport stream scrambler.
//!
//! The plugin discovers the target service through the section demux (SDT
//! for a name, then PAT, then PMT), advertises the ECM PID through a CA
//! descriptor in a rebuilt PMT, schedules two-slot crypto-period rotation
//! against packet-count clocks, multiplexes ECM packets into null-packet
//! slots, and applies DVB-CSA to the selected components.

pub mod config;
pub mod crypto_period;
pub mod csa;
pub mod ecmg;
pub mod error;
pub mod plugin;
pub mod simulcrypt;

pub use config::{Service, ScramblerConfig};
pub use crypto_period::{CryptoPeriod, EcmSlot};
pub use csa::{CsaKey, CW_SIZE, EntropyMode};
pub use ecmg::{EcmGenerator, EcmRequest, EcmResponse, EcmgClient, EcmgConfig, EcmgSession};
pub use error::ScramblerError;
pub use plugin::ScramblerPlugin;
pub use simulcrypt::{ChannelStatus, StreamStatus};

/// Result type for scrambler operations
pub type Result<T> = std::result::Result<T, ScramblerError>;
