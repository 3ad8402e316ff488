use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    InvalidArgument,
    SerializeFailed,
    DeserializeFailed,
    ConnectTimeout,
    ConnectRefused,
    ConnectFailed,
    ListenFailed,
    NotActive,
    NotWritable,
    SendFailed,
    RecvFailed,
    ParseFailed,
    ChannelUnavailable,
    ConnectionLost,
    RemoteFault,
    BindError,
    #[serde(untagged)]
    Unknown(String),
}

impl ErrorKind {
    /// Transport-level kinds. A call that failed with one of these may be
    /// retried by the caller; remote faults and bind errors will repeat.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ConnectTimeout
                | ErrorKind::ConnectRefused
                | ErrorKind::ConnectFailed
                | ErrorKind::NotActive
                | ErrorKind::NotWritable
                | ErrorKind::SendFailed
                | ErrorKind::RecvFailed
                | ErrorKind::ChannelUnavailable
                | ErrorKind::ConnectionLost
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }

    /// Wraps a failure raised by a bound service method.
    pub fn remote_fault(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::RemoteFault, err.to_string())
    }

    /// Converts the error returned by a service method. Used by the code
    /// `#[service]` generates.
    #[doc(hidden)]
    pub fn from_handler<E: std::fmt::Display + 'static>(err: E) -> Self {
        match (&err as &dyn std::any::Any).downcast_ref::<Error>() {
            Some(err) => err.clone().into_remote_fault(),
            None => Self::remote_fault(err),
        }
    }

    /// Remote faults and bind errors pass through untouched so nested calls
    /// do not stack prefixes.
    pub(crate) fn into_remote_fault(self) -> Self {
        match self.kind {
            ErrorKind::RemoteFault | ErrorKind::BindError => self,
            _ => Self::remote_fault(self),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            msg: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::DeserializeFailed,
            msg: value.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self {
            kind: ErrorKind::SerializeFailed,
            msg: value.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self {
            kind: ErrorKind::DeserializeFailed,
            msg: value.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
