use std::path::PathBuf;

/// Why a resource could not be produced. Always recoverable: the bridge keeps
/// whatever the node already had.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no such file `{0}`")]
    Missing(PathBuf),
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode `{path}`: {reason}")]
    Decode { path: PathBuf, reason: String },
}

impl LoadError {
    pub fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Decode { path: path.into(), reason: reason.to_string() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::Missing(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// Failures while standing the bridge up. Nothing on the per-tick path
/// produces one of these.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("node `{0}` is GPU-class but no GPU registry is available")]
    NoGpuRegistry(String),
    #[error("failed to spawn thread `{name}`: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("node `{node}` declares {expected} inputs but the element exposes {found}")]
    PortMismatch { node: String, expected: usize, found: usize },
}
