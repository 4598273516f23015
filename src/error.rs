use thiserror::Error;

/// Top-level error type for the pipeline binary and library surface.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("search error: {0}")]
    Search(#[from] SearchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors from loading, validating, or saving the coordinator's config file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found and could not be synthesised: {path}: {source}")]
    Missing {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config file at {path} is not valid JSON: {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("config field {field} is invalid: {reason}")]
    FieldInvalid { field: &'static str, reason: String },

    #[error("failed to write config to {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors in the framed worker wire protocol.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection closed while reading frame")]
    ConnectionClosed,

    #[error("frame length {len} exceeds maximum of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("malformed message payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("io error on worker connection: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected message {got} while awaiting {expected}")]
    UnexpectedMessage { got: &'static str, expected: &'static str },
}

/// Coordinator-level conditions. `NoTrainer` and `NetworkMissing` are fatal
/// to the whole process, per the state machine. `DuplicateTrainer` is not:
/// it is fatal only to the offending connection, which the caller must close
/// and drop while leaving the already-registered trainer and every other
/// session untouched.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("a training round requires a registered trainer, but none is connected")]
    NoTrainer,

    #[error("required network for step {step} is missing on disk and step is not 0")]
    NetworkMissing { step: u64 },

    /// Connection-scoped, not process-fatal: close and drop the newcomer's
    /// connection, keep the process and the existing trainer running.
    #[error("a trainer is already registered; a second trainer tried to register")]
    DuplicateTrainer,
}

/// Errors surfaced by the PUCT evaluator. These never leave the tree in a
/// partially-corrupted state: a node that fails prediction is simply left
/// `predicted = false` and is re-predicted on the next visit.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("oracle prediction failed: {0}")]
    OraclePredictionFailed(String),

    #[error("no legal actions available at the root")]
    NoLegalActions,
}
