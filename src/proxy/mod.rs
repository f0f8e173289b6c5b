pub mod gateway;
pub mod httpproxy;
pub mod websocket;

use async_trait::async_trait;

use crate::http::{Body, Request, Response, StatusCode};
use crate::router::{RouteValues, RouterError};

/// A bound route endpoint: owns one exchange from parsed request to written
/// response. Errors are already mapped to responses by the implementation.
#[async_trait]
pub trait Handler: Send + Sync {
	async fn handle(&self, req: Request, rv: RouteValues) -> Response;
}

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
	#[error("{0}")]
	Internal(String),
	#[error("{message}")]
	Filter { status: StatusCode, message: String },
	#[error("upstream call failed: {0}")]
	Proxy(String),
	#[error("context deadline exceeded")]
	Timeout,
	#[error("task not found: {0}")]
	TaskNotFound(String),
	#[error(transparent)]
	Router(#[from] RouterError),
	#[error("{0}")]
	Teapot(String),
}

impl GatewayError {
	pub fn internal(err: impl std::fmt::Display) -> GatewayError {
		GatewayError::Internal(err.to_string())
	}

	pub fn status(&self) -> StatusCode {
		match self {
			GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
			GatewayError::Filter { status, .. } => *status,
			GatewayError::Proxy(_) => StatusCode::BAD_GATEWAY,
			GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			GatewayError::TaskNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
			GatewayError::Router(RouterError::NoMatchFound) => StatusCode::NOT_FOUND,
			GatewayError::Router(RouterError::NoUrlRegistered) => StatusCode::INTERNAL_SERVER_ERROR,
			GatewayError::Teapot(_) => StatusCode::IM_A_TEAPOT,
		}
	}

	/// Status plus the error message as a plain-text body; no stack traces.
	pub fn into_response(self) -> Response {
		let msg = self.to_string();
		::http::Response::builder()
			.status(self.status())
			.header(::http::header::CONTENT_TYPE, "text/plain")
			.body(Body::from(msg))
			.expect("static response must build")
	}
}
