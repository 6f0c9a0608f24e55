use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Server error taxonomy. Upstream variants are swallowed at the resolver
/// boundary and turned into synthesized empty responses; the rest surface
/// to the client with the status from `status_code`.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Archive lookup yielded no data for the requested tile.
    #[error("tile not present in archive")]
    UpstreamEmpty,

    /// Archive read, HTTP fetch or decompression failure.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("render failed: {0}")]
    Render(String),

    /// Unresolvable style source at registration time.
    #[error("configuration error: {0}")]
    FatalConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServeError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ServeError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServeError::NotFound(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            // Empty upstreams are handled before reaching a response; if one
            // leaks this far the tile simply does not exist.
            ServeError::UpstreamEmpty => StatusCode::NOT_FOUND,
            ServeError::Upstream(_)
            | ServeError::Render(_)
            | ServeError::FatalConfig(_)
            | ServeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
