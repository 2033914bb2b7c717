use crate::layout::Direction;
use std::path::PathBuf;

/// Fatal faults raised while establishing the exchange.
///
/// None of these are retryable: each one means the environment (device,
/// region, scheduler permissions, configuration) is misconfigured.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read map size from {path}: {reason}")]
    MapSize { path: PathBuf, reason: String },

    #[error("device reports a zero-sized map")]
    ZeroMapSize,

    #[error("mmap of {len} bytes failed: {source}")]
    Map {
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid layout: {0}")]
    InvalidLayout(&'static str),

    #[error("region holds {actual} bytes but the layout needs {required}")]
    RegionTooSmall { required: usize, actual: usize },

    #[error("region base {addr:#x} is not aligned to {align} bytes")]
    Misaligned { addr: usize, align: usize },

    #[error("invalid magic marker {found:02x?}, expected {expected:02x?}")]
    BadMagic { found: [u8; 4], expected: [u8; 4] },

    #[error("{direction:?} buffer set indices {indices:?} are not a permutation of 0..3")]
    CorruptIndices {
        direction: Direction,
        indices: [u8; 3],
    },

    #[error("{what} failed: {source}")]
    RealTime {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("cycle period must be non-zero")]
    ZeroPeriod,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Usage errors of an established exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("payload of {len} bytes exceeds the {capacity}-byte payload region")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("this side does not {op} the {direction:?} buffer set")]
    WrongDirection {
        direction: Direction,
        op: &'static str,
    },

    #[error("{direction:?} buffer set index {index} names no buffer")]
    CorruptIndex { direction: Direction, index: u8 },

    #[error("the {direction:?} {role} endpoint is already in use")]
    AlreadyClaimed {
        direction: Direction,
        role: &'static str,
    },
}
