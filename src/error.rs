//! # Errors
//!
//! Expected failures are returned as typed [`Error`] values carrying the
//! reply status they surface as. Provider faults and invariant violations
//! are wrapped as [`Error::Unexpected`] at the dispatch boundary.

use http::StatusCode;
use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use thiserror::Error;

/// Errors surfaced in handler replies.
#[derive(Error, Debug)]
pub enum Error {
    /// The message failed schema or integrity validation.
    #[error(r#"{{"code": 400, "detail": "{0}"}}"#)]
    BadRequest(String),

    /// The message failed authentication or authorization.
    #[error(r#"{{"code": 401, "detail": "{0}"}}"#)]
    Unauthorized(String),

    /// The requested resource was not found.
    #[error(r#"{{"code": 404, "detail": "{0}"}}"#)]
    NotFound(String),

    /// The message conflicts with the current record state.
    #[error(r#"{{"code": 409, "detail": "{0}"}}"#)]
    Conflict(String),

    /// An engine fault: an invariant violation or provider failure.
    #[error(r#"{{"code": 500, "detail": "{0}"}}"#)]
    Unexpected(String),
}

impl Error {
    /// The reply status code for the error.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST.as_u16(),
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED.as_u16(),
            Self::NotFound(_) => StatusCode::NOT_FOUND.as_u16(),
            Self::Conflict(_) => StatusCode::CONFLICT.as_u16(),
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }

    /// The error as a `{code, detail}` JSON value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let (Self::BadRequest(detail)
        | Self::Unauthorized(detail)
        | Self::NotFound(detail)
        | Self::Conflict(detail)
        | Self::Unexpected(detail)) = self;

        json!({"code": self.code(), "detail": detail})
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<base64ct::Error> for Error {
    fn from(err: base64ct::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Construct an `Error::Unauthorized` error from a string or format.
#[doc(hidden)]
#[macro_export]
macro_rules! forbidden {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        $crate::Error::Unauthorized(format!($fmt $(, $($arg)*)?))
    };
}

/// Construct an `Error::BadRequest` error from a string or format.
#[doc(hidden)]
#[macro_export]
macro_rules! invalid {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        $crate::Error::BadRequest(format!($fmt $(, $($arg)*)?))
    };
}

/// Construct an `Error::Unexpected` error from a string or format.
#[doc(hidden)]
#[macro_export]
macro_rules! unexpected {
    ($fmt:expr $(, $($arg:tt)*)?) => {
        $crate::Error::Unexpected(format!($fmt $(, $($arg)*)?))
    };
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_codes() {
        let err = Error::NotFound("no matching record found".to_string());
        assert_eq!(err.code(), 404);
        assert_eq!(err.to_json(), json!({"code": 404, "detail": "no matching record found"}));
    }

    #[test]
    fn macros() {
        let err = forbidden!("{} is unauthorized", "did:example:bob");
        assert_eq!(err.code(), 401);

        let err = invalid!("immutable property changed");
        assert_eq!(err.code(), 400);

        let err = unexpected!("store failure");
        assert_eq!(err.code(), 500);
    }
}
