use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Open,
    Format,
    Io,
    Extract,
    Naming,
    Argument,
    Closed,
}

/// Errors surfaced by readers, writers, entries and extraction.
#[derive(Debug, Error)]
pub enum Error {
    /// A session could not be set up: bad identifier code, unsupported
    /// filter/format, invalid external program, or unreadable binding.
    #[error("{message}")]
    Open {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Input could not be decoded, or an entry lacks what the target
    /// format needs.
    #[error("{message}")]
    Format { message: String },

    /// The byte source or sink failed.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Materializing an entry on the filesystem failed.
    #[error("{}: {message}", path.display())]
    Extract {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// A symbolic filter or format name matched nothing.
    #[error("unknown {kind} name `{name}`")]
    Naming { kind: &'static str, name: String },

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("archive session is closed")]
    Closed,
}

impl Error {
    pub(crate) fn open(message: impl Into<String>) -> Self {
        Error::Open {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn open_io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Open {
            message: format!("{}: {}", message.into(), source),
            source: Some(source),
        }
    }

    pub(crate) fn format(message: impl Into<String>) -> Self {
        Error::Format {
            message: message.into(),
        }
    }

    pub(crate) fn extract(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Extract {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn extract_io(path: impl Into<PathBuf>, message: impl Into<String>, source: io::Error) -> Self {
        Error::Extract {
            path: path.into(),
            message: format!("{}: {}", message.into(), source),
            source: Some(source),
        }
    }

    /// Maps an I/O failure inside a container body. Running out of bytes
    /// there means the archive is truncated, which is a decode problem
    /// rather than a transport one.
    pub(crate) fn body(err: io::Error, what: &str) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::format(format!("Truncated {what} archive")),
            io::ErrorKind::InvalidData => Error::format(format!("Damaged {what} archive: {err}")),
            _ => Error::Io(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Open { .. } => ErrorKind::Open,
            Error::Format { .. } => ErrorKind::Format,
            Error::Io(_) => ErrorKind::Io,
            Error::Extract { .. } => ErrorKind::Extract,
            Error::Naming { .. } => ErrorKind::Naming,
            Error::Argument(_) => ErrorKind::Argument,
            Error::Closed => ErrorKind::Closed,
        }
    }

    /// OS error code of the underlying failure, when there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            Error::Open { source, .. } | Error::Extract { source, .. } => {
                source.as_ref().and_then(|e| e.raw_os_error())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_maps_eof_to_format() {
        let err = Error::body(io::Error::from(io::ErrorKind::UnexpectedEof), "tar");
        assert_eq!(err.kind(), ErrorKind::Format);
        assert_eq!(err.to_string(), "Truncated tar archive");
    }

    #[test]
    fn test_body_keeps_other_io() {
        let err = Error::body(io::Error::from(io::ErrorKind::PermissionDenied), "zip");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_errno_from_os_error() {
        let err = Error::open_io("cannot open", io::Error::from_raw_os_error(2));
        assert_eq!(err.errno(), Some(2));
        assert!(err.to_string().starts_with("cannot open: "));
    }

    #[test]
    fn test_naming_message() {
        let err = Error::Naming {
            kind: "format",
            name: "x_x".into(),
        };
        assert_eq!(err.to_string(), "unknown format name `x_x`");
        assert_eq!(err.kind(), ErrorKind::Naming);
    }
}
