use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use purplepages_util::FmtCompact as _;
use snafu::{Location, Snafu};
use tracing::warn;

const LOG_TARGET: &str = "purplepages::web";

/// Errors a request handler can surface; rendered as a plain 500 so store
/// internals never leak to clients.
#[derive(Debug, Snafu)]
pub enum WebError {
    #[snafu(transparent)]
    Analytics {
        source: purplepages_analytics::AnalyticsError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Store {
        source: purplepages_store::StoreError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        warn!(target: LOG_TARGET, err = %self.fmt_compact(), "Request handler failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}

pub type WebResult<T> = std::result::Result<T, WebError>;
