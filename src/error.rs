use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::sys::jvmti::jvmtiError;

/// Errors raised while acquiring or interpreting class bytes.
///
/// "Not found" is never an error: every lookup reports absence as `Ok(None)`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed class data at byte {offset}: {reason}")]
    MalformedClassData { offset: usize, reason: String },

    #[error("failed to read resource {resource}: {source}")]
    ResourceReadFailure {
        resource: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build agent artifact: {0}")]
    ArtifactBuildFailure(String),

    #[error("agent artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("failed to attach agent: {0}")]
    AttachFailure(String),

    #[error("illegal input class {0}: arrays and primitives have no nested classes")]
    IllegalInputClass(String),

    #[error("input class is null")]
    NullInputClass,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("JVMTI error: {0}")]
    Jvmti(jvmtiError),

    #[error("JNI error: {0}")]
    Jni(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Error::MalformedClassData {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn resource_read(resource: impl Into<String>, source: io::Error) -> Self {
        Error::ResourceReadFailure {
            resource: resource.into(),
            source,
        }
    }

    /// Recasts a failure to obtain the instrumentation capability as an
    /// attach failure, keeping bootstrap errors as they are.
    pub(crate) fn into_bootstrap_failure(self) -> Self {
        if self.is_bootstrap_failure() {
            self
        } else {
            Error::AttachFailure(format!("instrumentation unavailable: {self}"))
        }
    }

    /// Whether this error came out of agent bootstrap (build, locate or attach).
    pub fn is_bootstrap_failure(&self) -> bool {
        matches!(
            self,
            Error::ArtifactBuildFailure(_) | Error::ArtifactNotFound(_) | Error::AttachFailure(_)
        )
    }
}

impl From<jvmtiError> for Error {
    fn from(err: jvmtiError) -> Self {
        Error::Jvmti(err)
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Error::Io(e),
            other => Error::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
