use std::{error::Error, fmt, io};

use machine_learning::MlErr;

/// The trainer module's result type.
pub type Result<T> = std::result::Result<T, TrainerErr>;

/// Trainer runtime failures.
#[derive(Debug)]
pub enum TrainerErr {
    Io(io::Error),
    Ml(MlErr),
    Json(serde_json::Error),
    InvalidConfig(String),
    NoDevice,
    Collective {
        op: &'static str,
        detail: String,
    },
    Checkpoint(String),
    UnexpectedMessage {
        op: &'static str,
        got: &'static str,
    },
}

impl fmt::Display for TrainerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerErr::Io(e) => write!(f, "io error: {e}"),
            TrainerErr::Ml(e) => write!(f, "model error: {e}"),
            TrainerErr::Json(e) => write!(f, "json error: {e}"),
            TrainerErr::InvalidConfig(reason) => write!(f, "invalid config: {reason}"),
            TrainerErr::NoDevice => write!(f, "training requires at least one device"),
            TrainerErr::Collective { op, detail } => {
                write!(f, "collective {op} failed: {detail}")
            }
            TrainerErr::Checkpoint(reason) => write!(f, "checkpoint error: {reason}"),
            TrainerErr::UnexpectedMessage { op, got } => {
                write!(f, "unexpected message during {op}: got {got}")
            }
        }
    }
}

impl Error for TrainerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainerErr::Io(e) => Some(e),
            TrainerErr::Ml(e) => Some(e),
            TrainerErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for TrainerErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<serde_json::Error> for TrainerErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<safetensors::SafeTensorError> for TrainerErr {
    fn from(value: safetensors::SafeTensorError) -> Self {
        Self::Checkpoint(value.to_string())
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainerErr> for io::Error {
    fn from(value: TrainerErr) -> Self {
        match value {
            TrainerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
