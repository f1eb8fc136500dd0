//! Error types shared by the RPC services and the file system adapters.
//!
//! Operations on the local machine fail with ordinary [`std::io::Error`]s.
//! To ship those across the RPC they are folded into [`RemoteError`], a
//! serializable record of a closed [`ErrorKind`] plus the original arguments
//! (errno and message). Known kinds are rematerialized as the same kind on
//! the other side; anything else round-trips as [`ErrorKind::Other`] with the
//! original class name and arguments preserved.

use std::fmt;
use std::io;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Outcome of any fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the RPC transport and the file system layers.
#[derive(Debug, Error)]
pub enum Error {
    /// An error raised by the service on the other side of the RPC.
    #[error("{0}")]
    Remote(RemoteError),

    /// The authentication token was rejected by the server.
    #[error("token mismatch between client and server")]
    InvalidToken,

    /// Malformed frames, unknown record names, failed (de)serialization.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local I/O failure, including transport timeouts.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Error::Remote(err)
    }
}

impl Error {
    /// Negative-errno representation for the kernel file system boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Remote(err) => err.errno(),
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::InvalidToken | Error::Protocol(_) => libc::EIO,
        }
    }

    /// Fold this error into the serializable form used on the wire.
    pub(crate) fn to_remote(&self) -> RemoteError {
        match self {
            Error::Remote(err) => err.clone(),
            Error::Io(err) => RemoteError::from_io(err),
            Error::InvalidToken => {
                RemoteError::new(ErrorKind::Protocol, "token mismatch between client and server")
            }
            Error::Protocol(msg) => RemoteError::new(ErrorKind::Protocol, msg.clone()),
        }
    }
}

/// The closed set of error kinds the file system adapters distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidArgument,
    IsADirectory,
    NotADirectory,
    AlreadyExists,
    Io,
    Protocol,
    /// Any other error, preserved by class name and arguments.
    Other,
}

impl ErrorKind {
    fn name(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::IsADirectory => "IsADirectory",
            ErrorKind::NotADirectory => "NotADirectory",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::Io => "Io",
            ErrorKind::Protocol => "Protocol",
            ErrorKind::Other => "Other",
        }
    }

    fn from_name(name: &str) -> ErrorKind {
        match name {
            "NotFound" => ErrorKind::NotFound,
            "PermissionDenied" => ErrorKind::PermissionDenied,
            "InvalidArgument" => ErrorKind::InvalidArgument,
            "IsADirectory" => ErrorKind::IsADirectory,
            "NotADirectory" => ErrorKind::NotADirectory,
            "AlreadyExists" => ErrorKind::AlreadyExists,
            "Io" => ErrorKind::Io,
            "Protocol" => ErrorKind::Protocol,
            _ => ErrorKind::Other,
        }
    }

    /// The errno this kind maps to when no exact errno was preserved.
    pub fn errno(self) -> i32 {
        match self {
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::PermissionDenied => libc::EACCES,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::IsADirectory => libc::EISDIR,
            ErrorKind::NotADirectory => libc::ENOTDIR,
            ErrorKind::AlreadyExists => libc::EEXIST,
            ErrorKind::Io | ErrorKind::Protocol | ErrorKind::Other => libc::EIO,
        }
    }
}

/// A single positional argument of a transported error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorArg {
    Int(i64),
    Str(String),
}

/// An error as it travels over the RPC and through cached metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    /// Name the error was raised under; equals the kind name for known kinds.
    pub class_name: String,
    /// Original arguments: errno first when one was available, then message.
    pub args: Vec<ErrorArg>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RemoteError {
            kind,
            class_name: kind.name().to_string(),
            args: vec![ErrorArg::Str(message.into())],
        }
    }

    /// Capture an [`io::Error`], keeping the raw errno when one exists.
    pub fn from_io(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::InvalidArgument,
            io::ErrorKind::IsADirectory => ErrorKind::IsADirectory,
            io::ErrorKind::NotADirectory => ErrorKind::NotADirectory,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::Io,
        };

        let mut args = Vec::new();
        if let Some(errno) = err.raw_os_error() {
            args.push(ErrorArg::Int(i64::from(errno)));
        }
        args.push(ErrorArg::Str(err.to_string()));

        RemoteError {
            kind,
            class_name: kind.name().to_string(),
            args,
        }
    }

    /// The errno for this error: the preserved one if any, else the kind's.
    pub fn errno(&self) -> i32 {
        for arg in &self.args {
            if let ErrorArg::Int(errno) = arg {
                if let Ok(errno) = i32::try_from(*errno) {
                    return errno;
                }
            }
        }

        self.kind.errno()
    }

    /// Two errors compare equal for cache-freshness purposes when their kind
    /// and arguments match; the class name only matters for unknown kinds.
    pub fn same_failure(&self, other: &RemoteError) -> bool {
        self.kind == other.kind && self.args == other.args
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class_name)?;
        for arg in &self.args {
            match arg {
                ErrorArg::Int(n) => write!(f, " {n}")?,
                ErrorArg::Str(s) => write!(f, " {s}")?,
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct ExceptionBody {
    name: String,
    args: Vec<ErrorArg>,
}

#[derive(Serialize, Deserialize)]
struct ExceptionEnvelope {
    #[serde(rename = "__exception__")]
    exception: ExceptionBody,
}

impl Serialize for RemoteError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ExceptionEnvelope {
            exception: ExceptionBody {
                name: self.class_name.clone(),
                args: self.args.clone(),
            },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RemoteError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let envelope = ExceptionEnvelope::deserialize(deserializer)?;
        let body = envelope.exception;
        if body.name.is_empty() {
            return Err(D::Error::custom("exception record without a name"));
        }

        Ok(RemoteError {
            kind: ErrorKind::from_name(&body.name),
            class_name: body.name,
            args: body.args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_errno() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        let remote = RemoteError::from_io(&err);

        assert_eq!(remote.kind, ErrorKind::NotFound);
        assert_eq!(remote.errno(), libc::ENOENT);
    }

    #[test]
    fn unknown_kind_defaults_to_eio() {
        let remote = RemoteError {
            kind: ErrorKind::Other,
            class_name: "SomethingElse".to_string(),
            args: vec![ErrorArg::Str("boom".to_string())],
        };

        assert_eq!(remote.errno(), libc::EIO);
    }

    #[test]
    fn same_failure_ignores_class_name_for_known_kinds() {
        let a = RemoteError::new(ErrorKind::NotFound, "gone");
        let mut b = a.clone();
        b.class_name = "SomethingElse".to_string();

        assert!(a.same_failure(&b));

        b.args.push(ErrorArg::Int(2));
        assert!(!a.same_failure(&b));
    }
}
