use thiserror::Error;

/// Errors raised by the scrambler and its ECMG session.
#[derive(Error, Debug)]
pub enum ScramblerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TS layer error: {0}")]
    Ts(#[from] ts::TsError),

    #[error("ECMG protocol error: {0}")]
    Protocol(String),

    #[error("unexpected ECMG message type {0:#06x}")]
    UnexpectedMessage(u16),

    #[error("ECMG reported error status {status:#06x}")]
    EcmgStatus { status: u16 },

    #[error("ECMG connection closed")]
    Disconnected,

    #[error("invalid ECM size ({0} bytes), not a multiple of 188")]
    InvalidEcmSize(usize),
}
