#![forbid(unsafe_code)]

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HelixError {
	#[error("invalid helix request: {0}")]
	InvalidRequest(String),

	#[error("helix authorization failed: {0}")]
	AuthorizationFailed(String),

	#[error("missing permission '{0}' from token scopes")]
	TokenMissingScope(String),

	#[error("helix network error: {0}")]
	NetworkError(String),

	#[error("invalid helix result: {0}")]
	InvalidResult(String),

	#[error("helix subscription conflict: {0}")]
	SubscriptionConflict(String),
}

impl HelixError {
	pub fn is_auth(&self) -> bool {
		matches!(self, Self::AuthorizationFailed(_))
	}

	/// Map a non-success HTTP status onto the taxonomy.
	pub(crate) fn from_status(status: StatusCode, label: &str, body: &str) -> Self {
		let detail = format!("{label}: status={status} body={body}");
		match status {
			StatusCode::BAD_REQUEST => Self::InvalidRequest(detail),
			StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::AuthorizationFailed(detail),
			StatusCode::CONFLICT => Self::SubscriptionConflict(detail),
			_ => Self::NetworkError(detail),
		}
	}
}
