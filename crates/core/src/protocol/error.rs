use thiserror::Error;

/// Failure reported by a [`Host`](crate::host::Host) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("invalid or released handle")]
    BadHandle,

    #[error("operation unsupported by host")]
    Unsupported,

    #[error("host unavailable: {}", .message.as_deref().unwrap_or("no message"))]
    Unavailable { message: Option<String> },

    #[error("host io error: {reason}")]
    Io { reason: String },
}

impl HostError {
    pub fn unavailable<S: ToString>(message: Option<S>) -> Self {
        Self::Unavailable { message: message.map(|m| m.to_string()) }
    }

    pub fn io<S: ToString>(str: S) -> Self {
        Self::Io { reason: str.to_string() }
    }

    /// The message the host attached to this failure, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            HostError::Unavailable { message } => message.as_deref(),
            HostError::Io { reason } => Some(reason),
            HostError::BadHandle | HostError::Unsupported => None,
        }
    }
}

/// Every failure surfaced to callers of the bridge, the entities and the send pipeline.
///
/// Host failures are translated at the boundary: body reads and writes become [`FetchError::Io`],
/// dispatch and wait failures become [`FetchError::Network`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: HostError,
    },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("body has already been consumed")]
    AlreadyConsumed,

    #[error("type error: {reason}")]
    Type { reason: String },

    #[error("syntax error: {reason}")]
    Syntax { reason: String },

    #[error("invalid form data header")]
    InvalidFormDataHeader,

    #[error("invalid form data: {reason}")]
    InvalidFormData { reason: String },
}

impl FetchError {
    pub fn network<S: ToString>(str: S) -> Self {
        Self::Network { message: str.to_string() }
    }

    pub fn invalid_state<S: ToString>(str: S) -> Self {
        Self::InvalidState { reason: str.to_string() }
    }

    pub fn type_error<S: ToString>(str: S) -> Self {
        Self::Type { reason: str.to_string() }
    }

    pub fn syntax<S: ToString>(str: S) -> Self {
        Self::Syntax { reason: str.to_string() }
    }

    pub fn invalid_form_data<S: ToString>(str: S) -> Self {
        Self::InvalidFormData { reason: str.to_string() }
    }

    /// Stream that was already read from or has a reader attached.
    pub fn unusable_stream() -> Self {
        Self::invalid_state("readable stream locked or disturbed")
    }
}
