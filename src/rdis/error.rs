//! Crate-wide error enum. Each variant maps to a specific RESP error text
//! and a specific fate — fatal to the connection, or an ordinary reply —
//! with `Io`/`Protocol` as the only variants that terminate a connection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RdisError {
    /// Malformed framing or a codec bound was exceeded. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Well-formed RESP that isn't a valid command.
    #[error("ERR {0}")]
    Parse(String),

    /// Command applied to a key holding an incompatible value kind.
    #[error("WRONGTYPE {0}")]
    Type(String),

    /// Arity, parameter, or range violation.
    #[error("ERR {0}")]
    Arg(String),

    /// EXEC/DISCARD outside MULTI, or a forbidden command while subscribed.
    #[error("ERR {0}")]
    State(String),

    /// `0-0`, non-monotonic, or malformed stream id.
    #[error("ERR {0}")]
    StreamId(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RdisError {
    /// True when this error must close the connection rather than be
    /// returned as an ordinary RESP reply.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RdisError::Protocol(_) | RdisError::Io(_))
    }

    /// Renders the command-level RESP `SimpleError` text for this error.
    /// Fatal errors are not meant to be rendered this way; callers close the
    /// connection instead.
    pub fn resp_message(&self) -> String {
        self.to_string()
    }
}

pub type RdisResult<T> = Result<T, RdisError>;
