/// Reasons a set of test parameters cannot be used; detected before any socket is opened.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one stream is required")]
    NoStreams,

    #[error("{requested} streams requested; the platform maximum is {max}")]
    TooManyStreams { requested: usize, max: usize },

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("unsupported direction: {0}")]
    UnsupportedDirection(String),

    #[error("block size {size} is outside {min}..={max}")]
    BlockSize { size: usize, min: usize, max: usize },

    #[error("bandwidth {requested} bits/second is outside 1..={max}")]
    Bandwidth { requested: u64, max: u64 },

    #[error("the test amount must be non-zero")]
    ZeroAmount,

    #[error("exactly one of duration, bytes or packets must be given")]
    AmbiguousAmount,

    #[error("packet targets are only meaningful for UDP")]
    PacketTargetRequiresUdp,

    #[error("reporting interval of {0} ms is out of range")]
    Interval(u64),

    #[error("window of {size} bytes is outside 1..={max}")]
    Window { size: usize, max: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid settings: {0}")]
    Config(#[from] ConfigError),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("stream I/O failed repeatedly: {0}")]
    TransientIo(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("settings rejected by peer: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("String error: {0}")]
    String(String),
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::String(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::String(s)
    }
}

impl From<&String> for Error {
    fn from(s: &String) -> Self {
        Error::String(s.to_string())
    }
}

pub type BoxResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[macro_export]
macro_rules! error_gen {
    ($fmt:literal) => {
        $crate::error::Error::from(format!($fmt))
    };
    ($e:expr) => {
        $crate::error::Error::from($e)
    };
    ($fmt:literal, $($arg:tt)+) => {
        $crate::error::Error::from(format!($fmt, $($arg)+))
    };
}
