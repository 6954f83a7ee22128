use thiserror::Error;

/// HTTP status reported by the variable service when a lock is owned by
/// someone else or the caller's lease is no longer valid.
pub const CONFLICT_STATUS: u16 = 409;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A response was received but its status was not 2xx.
#[derive(Debug, Error)]
#[error("Unexpected response code: {status} ({body})")]
pub struct UnexpectedResponseError {
    pub status: u16,
    pub status_text: String,
    pub body: String,
    #[source]
    pub source: Option<BoxError>,
}

impl UnexpectedResponseError {
    pub fn new(status: u16, status_text: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            body: body.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn is_conflict(&self) -> bool {
        self.status == CONFLICT_STATUS
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// No response was received at all.
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    #[error(transparent)]
    UnexpectedResponse(#[from] UnexpectedResponseError),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation canceled")]
    Canceled,
}

impl ClientError {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        ClientError::Transport(err.into())
    }

    pub fn as_unexpected_response(&self) -> Option<&UnexpectedResponseError> {
        match self {
            ClientError::UnexpectedResponse(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.as_unexpected_response()
            .map(UnexpectedResponseError::is_conflict)
            .unwrap_or(false)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(Box::new(err))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum LockError {
    /// The lease is no longer valid or is owned by another holder.
    #[error("conflicting lock")]
    Conflict,

    #[error("lock held")]
    Held,

    #[error("lock not held")]
    NotHeld,

    #[error("lock acquired but the response carried no lock id")]
    MissingLockId,

    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl LockError {
    /// Conflict-class errors are expected signals that drive state
    /// transitions rather than failures.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LockError::Conflict | LockError::Held | LockError::NotHeld
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, LockError::Client(ClientError::Canceled))
    }
}

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LeaserError {
    #[error("lock administration failed: {0}")]
    Lock(#[from] LockError),

    #[error("protected function failed: {0}")]
    Protected(#[source] anyhow::Error),

    /// Returned instead of retrying when the leaser runs with
    /// `ConflictPolicy::Abandon`.
    #[error("lock abandoned: {0}")]
    Abandoned(#[source] LockError),

    #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<LeaserError>),
}

impl LeaserError {
    /// Folds a secondary error into this one without hiding either.
    pub fn merge(self, other: LeaserError) -> LeaserError {
        match self {
            LeaserError::Multiple(mut errors) => {
                errors.push(other);
                LeaserError::Multiple(errors)
            }
            primary => LeaserError::Multiple(vec![primary, other]),
        }
    }

    pub fn errors(&self) -> Vec<&LeaserError> {
        match self {
            LeaserError::Multiple(errors) => errors.iter().collect(),
            single => vec![single],
        }
    }
}

fn join_errors(errors: &[LeaserError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type LeaserResult<T> = Result<T, LeaserError>;
