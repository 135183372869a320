use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    SerializeFailed,
    DeserializeFailed,
    SerdeJsonError,
    ConnectFailed,
    ConnectionLost,
    SendFailed,
    MaxRetriesExceeded,
    AuthenticationFailed,
    PermissionDenied,
    ProxyClosed,
    DeadlineExceeded,
    UnsupportedVersion,
    MethodNotFound,
    QueueNotFound,
    MessageTooLarge,
    AlreadySubscribed,
    StreamClosed,
    Application,
    #[serde(untagged)]
    Unknown(String),
}

/// Error carried by every fallible operation, and by failed replies on the wire.
///
/// `call_site` is filled in on the client when a failure is raised to the
/// caller. It never crosses the wire, so the server's own context is always
/// stripped, and it does not take part in equality.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
    #[serde(skip)]
    pub call_site: Option<Arc<str>>,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
            call_site: None,
        }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self::new(kind, String::default())
    }

    /// Errors the reconnecting wrapper is allowed to retry.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConnectFailed
                | ErrorKind::ConnectionLost
                | ErrorKind::SendFailed
                | ErrorKind::MaxRetriesExceeded
        )
    }

    #[must_use]
    pub fn with_call_site(mut self, call_site: Arc<str>) -> Self {
        self.call_site = Some(call_site);
        self
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.msg == other.msg
    }
}

impl Eq for Error {}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self::new(ErrorKind::InvalidArgument, value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::new(ErrorKind::SerdeJsonError, value.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self::new(ErrorKind::SerializeFailed, value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self::new(ErrorKind::DeserializeFailed, value.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)?;
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)?;
        }
        if let Some(call_site) = &self.call_site {
            write!(f, "\n  called from: {call_site}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
