use thiserror::Error;

use crate::pipeline::types::{MAX_IMAGE_COUNT, MAX_REFERENCE_PHOTOS};

pub const RATE_LIMIT_NOTICE: &str =
    "The image service rate limit was exceeded. Please wait a minute and try again.";

/// Structured failure category decided once, where the backend response is
/// inspected. Consumers branch on this instead of re-reading message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    RateLimited,
    Unauthorized,
    Malformed,
    Transient,
    Fatal,
}

impl BackendErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            BackendErrorKind::RateLimited => "rate_limited",
            BackendErrorKind::Unauthorized => "unauthorized",
            BackendErrorKind::Malformed => "malformed",
            BackendErrorKind::Transient => "transient",
            BackendErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Malformed, message)
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to plan photoshoot: {0}")]
    Backend(#[source] BackendError),
    #[error("Failed to plan photoshoot: model returned empty response")]
    EmptyResponse,
    #[error("Failed to plan photoshoot: response is not a valid plan ({0})")]
    Malformed(#[source] serde_json::Error),
    #[error("Failed to plan photoshoot: plan contains no scenarios")]
    NoScenarios,
}

impl PlanError {
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            PlanError::Backend(err) => err.kind,
            PlanError::EmptyResponse | PlanError::Malformed(_) | PlanError::NoScenarios => {
                BackendErrorKind::Malformed
            }
        }
    }
}

/// Input problems caught before any backend is contacted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Please upload at least one photo of yourself.")]
    MissingSubjectPhotos,
    #[error("Replicate mode needs at least one location/reference photo.")]
    MissingReferencePhotos,
    #[error("Selfie and replicate modes cannot be combined.")]
    ConflictingModes,
    #[error("Image count must be between 1 and {max} (got {requested}).", max = MAX_IMAGE_COUNT)]
    ImageCountOutOfRange { requested: usize },
    #[error("At most {max} {field} photos are allowed (got {count}).", max = MAX_REFERENCE_PHOTOS)]
    TooManyPhotos { field: &'static str, count: usize },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("{source}")]
    Image {
        index: usize,
        #[source]
        source: BackendError,
    },
}

impl PipelineError {
    pub fn kind(&self) -> BackendErrorKind {
        match self {
            PipelineError::Plan(err) => err.kind(),
            PipelineError::Image { source, .. } => source.kind,
        }
    }
}

/// What the user is shown for a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Permission,
    Generic,
}

impl ErrorClass {
    pub fn from_kind(kind: BackendErrorKind) -> Self {
        match kind {
            BackendErrorKind::RateLimited => ErrorClass::RateLimit,
            BackendErrorKind::Unauthorized => ErrorClass::Permission,
            BackendErrorKind::Malformed | BackendErrorKind::Transient | BackendErrorKind::Fatal => {
                ErrorClass::Generic
            }
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Permission => "permission",
            ErrorClass::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub message: String,
    pub detail: String,
    pub class: ErrorClass,
    pub kind: BackendErrorKind,
    pub requires_reauth: bool,
}

impl FailureReport {
    pub fn from_error(err: &PipelineError) -> Self {
        let kind = err.kind();
        let detail = err.to_string();
        let class = ErrorClass::from_kind(kind);
        let message = match class {
            ErrorClass::RateLimit => RATE_LIMIT_NOTICE.to_string(),
            ErrorClass::Permission | ErrorClass::Generic => detail.clone(),
        };
        FailureReport {
            message,
            detail,
            class,
            kind,
            requires_reauth: class == ErrorClass::Permission,
        }
    }
}
