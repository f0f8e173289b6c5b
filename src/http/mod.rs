pub mod shadow;
pub mod updaters;

#[cfg(test)]
pub mod tests_common;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};
use bytes::Bytes;
use http_body_util::BodyExt;

pub mod x_headers {
	use http::HeaderName;

	pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
	pub const X_CONTINUE_ON_ERROR: HeaderName = HeaderName::from_static("x-continue-on-error");
	pub const MESSAGE_TYPE: HeaderName = HeaderName::from_static("message-type");
}

/// Collects `body` into memory and returns the buffered bytes together with
/// any trailers the peer sent.
pub async fn buffer_body(body: Body) -> Result<(Bytes, HeaderMap), Error> {
	let collected = body.collect().await?;
	let trailers = collected.trailers().cloned().unwrap_or_default();
	Ok((collected.to_bytes(), trailers))
}

/// Whether a response opted out of short-circuiting on a non-success status.
pub fn continue_on_error(headers: &HeaderMap) -> bool {
	headers
		.get(x_headers::X_CONTINUE_ON_ERROR)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
