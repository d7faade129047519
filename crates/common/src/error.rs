use std::error::Error as StdError;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors shared across arachne crates.
///
/// Each variant corresponds to one propagation class: lookups that miss map
/// to 404 at the HTTP boundary, auth failures to 401, capability and
/// ownership failures to 403, malformed input to 400, duplicate inserts are
/// surfaced as idempotent upserts with a warning, and upstream rate limits
/// or 5xx responses are returned to the caller to retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A referenced record does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// Authentication failed or was missing.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Authenticated but not permitted.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// Missing or malformed parameters.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Duplicate insert or state conflict.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Upstream rate limit or 5xx; the caller decides whether to retry.
    #[error("transient upstream failure: {context}")]
    Transient { context: String },

    /// Unrecoverable process-level failure (database open, bind).
    #[error("fatal: {context}: {source}")]
    Fatal {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Database operation failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound {
            what: what.to_string(),
        }
    }

    #[must_use]
    pub fn unauthorized(message: impl std::fmt::Display) -> Self {
        Self::Unauthorized {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn forbidden(reason: impl std::fmt::Display) -> Self {
        Self::Forbidden {
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl std::fmt::Display) -> Self {
        Self::BadRequest {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn conflict(message: impl std::fmt::Display) -> Self {
        Self::Conflict {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn transient(context: impl std::fmt::Display) -> Self {
        Self::Transient {
            context: context.to_string(),
        }
    }

    #[must_use]
    pub fn fatal(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Fatal {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// HTTP status this error maps to at the gateway boundary.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Unauthorized { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::BadRequest { .. } => 400,
            Self::Conflict { .. } => 409,
            Self::Transient { .. } => 502,
            Self::Fatal { .. } | Self::Database(_) | Self::SerdeJson(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::not_found("entity").http_status(), 404);
        assert_eq!(Error::unauthorized("no token").http_status(), 401);
        assert_eq!(Error::forbidden("not owner").http_status(), 403);
        assert_eq!(Error::bad_request("missing code").http_status(), 400);
        assert_eq!(Error::conflict("duplicate row").http_status(), 409);
        assert_eq!(Error::transient("rate limited").http_status(), 502);
    }

    #[test]
    fn not_found_message_names_the_record() {
        let err = Error::not_found("entity 9a1");
        assert_eq!(err.to_string(), "entity 9a1 not found");
    }
}
