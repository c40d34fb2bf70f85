//! Error types for hvrpc calls.

use std::io;

use hvrpc_proto::{ApiId, ErrorCode, MessageKind, WireError};

/// Alias for `Result<T, hvrpc::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Caller input rejected before any message was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Invalid {
    /// Missing or out-of-range call parameters.
    #[error("invalid parameters: {0}")]
    Params(&'static str),

    /// Api id outside the known enumeration.
    #[error("unknown api id {0}")]
    Api(u32),

    /// A buffer larger than 64 MiB.
    #[error("buffer of {0} bytes exceeds the 64 MiB limit")]
    BufferTooLarge(u64),

    /// A zero-byte allocation request.
    #[error("buffer size must be non-zero")]
    ZeroSize,
}

impl Invalid {
    /// The boundary error code this rejection corresponds to.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Params(_) | Self::ZeroSize => ErrorCode::InvalidParams,
            Self::Api(_) => ErrorCode::InvalidApi,
            Self::BufferTooLarge(_) => ErrorCode::BufferTooLarge,
        }
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed caller input; nothing reached the wire.
    Validation,
    /// Malformed or unexpected response; no partial result.
    Protocol,
    /// The transport could not be opened or failed mid-call.
    Transport,
    /// The host answered with a non-OK error code.
    Host,
    /// Local memory could not be allocated.
    Resource,
}

/// Errors returned by hvrpc operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller input was rejected locally.
    #[error(transparent)]
    Invalid(#[from] Invalid),

    /// The response frame violated the wire layout.
    #[error("malformed response: {0}")]
    Protocol(WireError),

    /// The response answered a different request.
    #[error("response id {got} does not match request id {expected}")]
    Correlation {
        /// Id sent.
        expected: u64,
        /// Id received.
        got: u64,
    },

    /// The response was for a different api.
    #[error("expected {expected:?} response, got {got:?}")]
    UnexpectedApi {
        /// Api called.
        expected: ApiId,
        /// Api answered.
        got: ApiId,
    },

    /// The peer sent a message of the wrong kind.
    #[error("unexpected {0:?} message")]
    UnexpectedKind(MessageKind),

    /// The endpoint could not be reached.
    #[error("transport endpoint {endpoint} unavailable")]
    TransportUnavailable {
        /// Endpoint that was tried.
        endpoint: String,
        /// Underlying failure (not found, permission denied, ...).
        #[source]
        source: io::Error,
    },

    /// The transport failed during a call.
    #[error("transport failure")]
    Transport(#[from] io::Error),

    /// The host rejected the call.
    #[error("{api:?} rejected by host: {}", describe(.code))]
    Host {
        /// Api called.
        api: ApiId,
        /// Raw error code from the response header.
        code: i32,
    },

    /// Page-aligned memory could not be allocated.
    #[error("failed to allocate {0} bytes")]
    Alloc(usize),
}

impl Error {
    /// Maps a response decoding failure. An unknown api id is a validation
    /// failure; everything else is a protocol failure.
    pub(crate) const fn from_wire(err: WireError) -> Self {
        match err {
            WireError::UnknownApi(id) => Self::Invalid(Invalid::Api(id)),
            other => Self::Protocol(other),
        }
    }

    /// Coarse classification.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::Validation,
            Self::Protocol(_)
            | Self::Correlation { .. }
            | Self::UnexpectedApi { .. }
            | Self::UnexpectedKind(_) => ErrorKind::Protocol,
            Self::TransportUnavailable { .. } | Self::Transport(_) => ErrorKind::Transport,
            Self::Host { .. } => ErrorKind::Host,
            Self::Alloc(_) => ErrorKind::Resource,
        }
    }

    /// The host error code, for [`Error::Host`].
    pub const fn host_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Host { code, .. } => ErrorCode::from_raw(*code),
            _ => None,
        }
    }
}

/// Renders a raw code by name when it is a known one.
#[allow(clippy::trivially_copy_pass_by_ref)]
fn describe(code: &i32) -> String {
    ErrorCode::from_raw(*code).map_or_else(|| format!("code {code}"), |c| format!("{c:?} ({code})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_api_is_validation() {
        let err = Error::from_wire(WireError::UnknownApi(7));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(matches!(err, Error::Invalid(Invalid::Api(7))));
    }

    #[test]
    fn bad_magic_is_protocol() {
        let err = Error::from_wire(WireError::BadMagic(0));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn host_error_names_known_codes() {
        let err = Error::Host {
            api: ApiId::BufferTest,
            code: -4,
        };
        assert_eq!(err.host_code(), Some(ErrorCode::BufferTooLarge));
        assert_eq!(
            err.to_string(),
            "BufferTest rejected by host: BufferTooLarge (-4)"
        );
    }

    #[test]
    fn invalid_maps_to_codes() {
        assert_eq!(Invalid::Params("x").code(), ErrorCode::InvalidParams);
        assert_eq!(Invalid::Api(0).code(), ErrorCode::InvalidApi);
        assert_eq!(
            Invalid::BufferTooLarge(1).code(),
            ErrorCode::BufferTooLarge
        );
    }
}
