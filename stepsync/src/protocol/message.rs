/// Requests the driver sends to the service.
///
/// The service side also uses this type to classify whatever it receives, so
/// unknown payloads are kept in [`Request::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask the service to begin its task.
    Start,
    /// Ask to be answered once the task has finished.
    NotifyCompletion,
    /// Anything else; the service answers `"error"`.
    Other(String),
}

/// Replies the service sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The task was accepted and is running.
    Started,
    /// The task finished.
    Completed,
    /// The service rejected the request.
    Error,
    /// A payload outside the protocol vocabulary.
    Other(String),
}

pub const START: &str = "start";
pub const NOTIFY_COMPLETION: &str = "notify_completion";
pub const STARTED: &str = "started";
pub const COMPLETED: &str = "completed";
pub const ERROR: &str = "error";

impl Request {
    /// Wire payload of this request.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => START,
            Self::NotifyCompletion => NOTIFY_COMPLETION,
            Self::Other(raw) => raw,
        }
    }

    /// Classifies a received payload. Invalid UTF-8 is replaced lossily.
    #[must_use]
    pub fn parse(payload: &[u8]) -> Self {
        match &*String::from_utf8_lossy(payload) {
            START => Self::Start,
            NOTIFY_COMPLETION => Self::NotifyCompletion,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl Reply {
    /// Wire payload of this reply.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Started => STARTED,
            Self::Completed => COMPLETED,
            Self::Error => ERROR,
            Self::Other(raw) => raw,
        }
    }

    /// Classifies a received payload. Invalid UTF-8 is replaced lossily.
    #[must_use]
    pub fn parse(payload: &[u8]) -> Self {
        match &*String::from_utf8_lossy(payload) {
            STARTED => Self::Started,
            COMPLETED => Self::Completed,
            ERROR => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
