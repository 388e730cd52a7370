use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("server template directory {0} does not exist")]
    TemplateMissing(PathBuf),
    #[error("server configuration file {0} not found")]
    ConfigMissing(PathBuf),
    #[error("copy of {src} to {dst} did not verify after {attempts} attempts")]
    RetriesExhausted {
        src: PathBuf,
        dst: PathBuf,
        attempts: usize,
    },
    #[error("port for instance {index} overflows (base port {base_port})")]
    PortOverflow { index: usize, base_port: u16 },
    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Readiness,
    Bootstrap,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Readiness => f.write_str("server readiness"),
            Self::Bootstrap => f.write_str("privilege bootstrap"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{stage} failed after {attempts} attempts")]
    RetriesExhausted {
        stage: LifecycleStage,
        attempts: usize,
    },
    #[error("session manager failed during {stage}: {message}")]
    Session {
        stage: LifecycleStage,
        message: String,
    },
    #[error("agent runtime failed during {stage}: {message}")]
    Runtime {
        stage: LifecycleStage,
        message: String,
    },
    #[error("interrupted during {0}")]
    Interrupted(LifecycleStage),
}
