use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use comms::CommErr;
use ndarray::ShapeError;

use crate::state::TrainingState;

/// The result type used in the entire sharding module.
pub type Result<T> = std::result::Result<T, ShardErr>;

/// The sharding module's error type.
///
/// Every variant is fail-fast: none of them leave the model in a state from which the
/// current step can be resumed.
#[derive(Debug)]
pub enum ShardErr {
    InvalidState {
        unit: String,
        expected: Vec<TrainingState>,
        actual: TrainingState,
    },
    GradRequiresGrad {
        param: String,
    },
    HookNotArmed {
        param: String,
    },
    PendingGradients {
        unit: String,
        pending: usize,
    },
    UnexpectedGradShape {
        param: String,
        got: Vec<usize>,
        full: Vec<usize>,
        shard: usize,
    },
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    FullParamsMissing {
        param: String,
    },
    UnknownUnit(usize),
    UnknownParamId(usize),
    UnknownParam {
        unit: String,
        name: String,
    },
    DuplicateParam(String),
    Config(String),
    Comm(CommErr),
    Shape(ShapeError),
    Io(io::Error),
    Json(serde_json::Error),
}

impl Display for ShardErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardErr::InvalidState {
                unit,
                expected,
                actual,
            } => {
                let expected: Vec<_> = expected.iter().map(ToString::to_string).collect();
                format!(
                    "unit `{unit}`: expected to be in states [{}] but current state is {actual}",
                    expected.join(", ")
                )
            }
            ShardErr::GradRequiresGrad { param } => format!(
                "the gradient of `{param}` requires gradients, only gradients that don't require gradients are supported"
            ),
            ShardErr::HookNotArmed { param } => format!(
                "received a gradient for `{param}` but no forward use of it is waiting for one"
            ),
            ShardErr::PendingGradients { unit, pending } => format!(
                "unit `{unit}` finished the backward pass with {pending} gradient contributions still pending"
            ),
            ShardErr::UnexpectedGradShape {
                param,
                got,
                full,
                shard,
            } => format!(
                "unexpected gradient shape {got:?} for `{param}`, expected the full shape {full:?} or a shard of {shard} elements"
            ),
            ShardErr::SizeMismatch {
                what,
                got,
                expected,
            } => format!("There's a size mismatch in {what}, got {got} and expected {expected}"),
            ShardErr::FullParamsMissing { param } => {
                format!("the full parameter `{param}` was used before being gathered")
            }
            ShardErr::UnknownUnit(id) => format!("there's no unit with id {id}"),
            ShardErr::UnknownParamId(id) => format!("there's no parameter with id {id}"),
            ShardErr::UnknownParam { unit, name } => {
                format!("unit `{unit}` has no parameter named `{name}`")
            }
            ShardErr::DuplicateParam(name) => format!("the parameter `{name}` is registered twice"),
            ShardErr::Config(msg) => format!("invalid configuration: {msg}"),
            ShardErr::Comm(e) => format!("collective failed: {e}"),
            ShardErr::Shape(e) => format!("shape error: {e}"),
            ShardErr::Io(e) => format!("io error: {e}"),
            ShardErr::Json(e) => format!("json error: {e}"),
        };

        write!(f, "{s}")
    }
}

impl Error for ShardErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShardErr::Comm(e) => Some(e),
            ShardErr::Shape(e) => Some(e),
            ShardErr::Io(e) => Some(e),
            ShardErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommErr> for ShardErr {
    fn from(value: CommErr) -> Self {
        Self::Comm(value)
    }
}

impl From<ShapeError> for ShardErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<io::Error> for ShardErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ShardErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
