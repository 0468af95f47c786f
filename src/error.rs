use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors raised while locating or opening a resource. Implements
/// [`IntoResponse`].
///
/// Malformed request headers are never errors; they degrade to serving the
/// full representation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A physical file path was not absolute.
    #[error("path '{}' was not rooted", .0.display())]
    PathNotRooted(PathBuf),

    /// The file does not exist, is not a regular file, or escapes its root.
    #[error("could not find file: {}", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PathNotRooted(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(error = %self, %status, "resumable response failed");
        status.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let response = Error::NotFound(PathBuf::from("missing.txt")).into_response();
        assert_eq!(StatusCode::NOT_FOUND, response.status());

        let response = Error::PathNotRooted(PathBuf::from("relative.txt")).into_response();
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, response.status());

        let io = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, Error::from(io).into_response().status());
    }

    #[test]
    fn test_display() {
        let err = Error::PathNotRooted(PathBuf::from("relative.txt"));
        assert_eq!("path 'relative.txt' was not rooted", err.to_string());
    }
}
