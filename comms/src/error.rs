use std::{error::Error, fmt, io};

/// The comms module's result type.
pub type Result<T> = std::result::Result<T, CommErr>;

/// Collective communication failures.
///
/// None of these are recoverable: a worker that observes one has left the
/// group's collective schedule and the step must be aborted.
#[derive(Debug)]
pub enum CommErr {
    Io(io::Error),
    ShapeMismatch {
        op: &'static str,
        got: usize,
        expected: usize,
    },
    InvalidShardCount {
        len: usize,
        shard_count: usize,
    },
    Desync {
        expected: &'static str,
        got: &'static str,
    },
    UnexpectedMessage {
        got: &'static str,
    },
    Disconnected {
        rank: usize,
    },
    Remote(String),
}

impl fmt::Display for CommErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommErr::Io(e) => write!(f, "io error: {e}"),
            CommErr::ShapeMismatch { op, got, expected } => {
                write!(f, "{op} length mismatch: got {got}, expected {expected}")
            }
            CommErr::InvalidShardCount { len, shard_count } => write!(
                f,
                "can't split a tensor of {len} elements into {shard_count} equal shards"
            ),
            CommErr::Desync { expected, got } => write!(
                f,
                "collective schedule diverged: expected {expected}, got {got}"
            ),
            CommErr::UnexpectedMessage { got } => write!(f, "unexpected message: got {got}"),
            CommErr::Disconnected { rank } => write!(f, "worker {rank} left the group"),
            CommErr::Remote(e) => write!(f, "remote worker failed: {e}"),
        }
    }
}

impl Error for CommErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CommErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
