use std::fmt;
use std::io;

/// Wire-compatible status/result codes.
///
/// Kept `#[repr(u8)]` so a kind doubles as the integer `status` carried on a
/// `result` envelope.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ErrorKind {
    NotSupported = 1,
    NotRegistered = 2,
    Busy = 3,
    Data = 4,
    Timeout = 5,
    Io = 6,
    Eof = 7,
    Canceled = 8,
    Internal = 9,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotSupported => "not supported",
            ErrorKind::NotRegistered => "not registered",
            ErrorKind::Busy => "busy",
            ErrorKind::Data => "invalid data",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "i/o error",
            ErrorKind::Eof => "connection closed",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal error",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The wire `status` this error maps to on a result envelope.
    pub fn status_code(&self) -> i64 {
        -(self.kind as i64)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn not_registered() -> Self {
        Self {
            kind: ErrorKind::NotRegistered,
            message: None,
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }

    pub fn timeout() -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: None,
        }
    }

    pub fn eof() -> Self {
        Self {
            kind: ErrorKind::Eof,
            message: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: ErrorKind::Canceled,
            message: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.kind.as_str(), m),
            None => write!(f, "{}", self.kind.as_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::eof()
        } else {
            Error::new(ErrorKind::Io, e.to_string())
        }
    }
}

impl From<&io::Error> for Error {
    fn from(e: &io::Error) -> Self {
        Error::new(ErrorKind::Io, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorKind::Data, e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::timeout()
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(_: async_channel::SendError<T>) -> Self {
        Error::not_registered()
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Self {
        Error::new(ErrorKind::Data, e.to_string())
    }
}
