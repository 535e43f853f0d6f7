use thiserror::Error;

/// Errors surfaced across the router, partition, and connection layers.
///
/// Variant names mirror the error kinds named by the wire protocol so that
/// `Error::name()` round-trips into the `!<name>` frame a client receives.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("out of order store: expected id {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("partition io error: {0}")]
    PartitionIo(#[source] std::io::Error),

    #[error("disk full: {used_pct:.1}% used")]
    DiskFull { used_pct: f64 },

    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    #[error("slow consumer: route for {0} unsubscribed")]
    SlowConsumer(String),

    #[error("server shutting down")]
    ServerShuttingDown,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// The `!<name>` token used on the wire for this error kind.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Error::MalformedFrame(_) => "bad-request",
            Error::OutOfOrder { .. } => "out-of-order",
            Error::PartitionIo(_) => "send-failed",
            Error::DiskFull { .. } => "disk-full",
            Error::UnknownPartition(_) => "unknown-partition",
            Error::SlowConsumer(_) => "route-lost",
            Error::ServerShuttingDown => "server-shutting-down",
            Error::BadRequest(_) => "bad-request",
            Error::Io(_) => "io-error",
            Error::Serialization(_) => "bad-request",
            Error::Config(_) => "config-error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
