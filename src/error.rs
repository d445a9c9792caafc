use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum GatherError {
    Config(String),
    Io(std::io::Error),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    MissingPart { rank: usize, path: PathBuf },
    CorruptPart { path: PathBuf, reason: String },
    ShortResults { expected: usize, got: usize },
    Comm(String),
    CollectionTimeout(String),
    Compute(String),
    Other(String),
}

impl fmt::Display for GatherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatherError::Config(e) => write!(f, "Configuration error: {}", e),
            GatherError::Io(e) => write!(f, "IO error: {}", e),
            GatherError::Serialization(e) => write!(f, "Serialization error: {}", e),
            GatherError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            GatherError::Json(e) => write!(f, "JSON error: {}", e),
            GatherError::MissingPart { rank, path } => {
                write!(f, "Missing partial result for rank {}: {}", rank, path.display())
            }
            GatherError::CorruptPart { path, reason } => {
                write!(f, "Corrupt partial result {}: {}", path.display(), reason)
            }
            GatherError::ShortResults { expected, got } => write!(
                f,
                "Collected {} results but the dataset has {} items",
                got, expected
            ),
            GatherError::Comm(e) => write!(f, "Communication error: {}", e),
            GatherError::CollectionTimeout(e) => write!(f, "Collection timed out: {}", e),
            GatherError::Compute(e) => write!(f, "Compute error: {}", e),
            GatherError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for GatherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatherError::Io(e) => Some(e),
            GatherError::Serialization(e) => Some(e.as_ref()),
            GatherError::Deserialization(e) => Some(e.as_ref()),
            GatherError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bincode::error::EncodeError> for GatherError {
    fn from(err: bincode::error::EncodeError) -> Self {
        GatherError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for GatherError {
    fn from(err: bincode::error::DecodeError) -> Self {
        GatherError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for GatherError {
    fn from(err: std::io::Error) -> Self {
        GatherError::Io(err)
    }
}

impl From<serde_json::Error> for GatherError {
    fn from(err: serde_json::Error) -> Self {
        GatherError::Json(err)
    }
}

impl From<String> for GatherError {
    fn from(err: String) -> Self {
        GatherError::Other(err)
    }
}

impl From<&str> for GatherError {
    fn from(err: &str) -> Self {
        GatherError::Other(err.to_string())
    }
}
