use std::collections::HashMap;

use bytes::Bytes;

use crate::http::{Body, Error, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, header};
use crate::router::RouteValues;

#[cfg(test)]
#[path = "shadow_test.rs"]
mod tests;

/// Parsed url-encoded form values. Keys preserve their multi-value shape.
pub type Form = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
	pub value: Form,
	pub file: HashMap<String, Vec<MultipartFile>>,
}

#[derive(Debug, Clone)]
pub struct MultipartFile {
	pub filename: String,
	pub headers: HeaderMap,
	pub content: Bytes,
}

/// Options applied to a request produced by [`ShadowRequest::clone_request`].
#[derive(Debug, Clone)]
pub enum RequestOption {
	/// Re-target the clone: take scheme and authority from the given URI,
	/// keeping the clone's own path and query.
	WithUri(Uri),
	WithMethod(Method),
}

impl RequestOption {
	fn apply(&self, req: &mut Request) {
		match self {
			RequestOption::WithUri(target) => {
				let mut parts = std::mem::take(req.uri_mut()).into_parts();
				parts.scheme = target.scheme().cloned();
				parts.authority = target.authority().cloned();
				if parts.path_and_query.is_none() {
					parts.path_and_query = Some(::http::uri::PathAndQuery::from_static("/"));
				}
				if let Ok(uri) = Uri::from_parts(parts) {
					*req.uri_mut() = uri;
				}
				if let Some(authority) = target.authority()
					&& let Ok(host) = HeaderValue::from_str(authority.as_str())
				{
					req.headers_mut().insert(header::HOST, host);
				}
			},
			RequestOption::WithMethod(method) => *req.method_mut() = method.clone(),
		}
	}
}

/// A buffered, re-readable wrapper around an HTTP request.
///
/// The body is read fully into a canonical [`Bytes`] buffer at construction;
/// every clone re-reads that same buffer from offset zero, so the request can
/// be handed to arbitrarily many callers without consuming it.
pub struct ShadowRequest {
	request: Request,
	data: Bytes,
	trailers: HeaderMap,
	form: Option<Form>,
	multipart: Option<MultipartForm>,
	pub route_values: RouteValues,
}

impl ShadowRequest {
	/// Buffers the request body and installs a fresh reader over it. The only
	/// fallible step is reading the body; everything afterwards is infallible.
	pub async fn new(request: Request) -> Result<ShadowRequest, Error> {
		let (parts, body) = request.into_parts();
		let (data, trailers) = super::buffer_body(body).await?;
		let mut request = Request::from_parts(parts, Body::from(data.clone()));
		request.headers_mut().remove(header::CONTENT_LENGTH);
		Ok(ShadowRequest {
			request,
			data,
			trailers,
			form: None,
			multipart: None,
			route_values: RouteValues::new(),
		})
	}

	/// Builds a shadow directly from buffered parts; used when the body bytes
	/// are already in hand (bus replies, websocket frames).
	pub fn from_parts(method: Method, uri: Uri, headers: HeaderMap, data: Bytes) -> ShadowRequest {
		let mut request = Request::new(Body::from(data.clone()));
		*request.method_mut() = method;
		*request.uri_mut() = uri;
		*request.headers_mut() = headers;
		ShadowRequest {
			request,
			data,
			trailers: HeaderMap::new(),
			form: None,
			multipart: None,
			route_values: RouteValues::new(),
		}
	}

	/// Reinstalls a fresh body reader over the canonical buffer.
	pub fn reset(&mut self) {
		*self.request.body_mut() = Body::from(self.data.clone());
	}

	/// Points the canonical buffer at `data` and resets the reader.
	pub fn replace_body(&mut self, data: Bytes) {
		self.data = data;
		self.reset();
	}

	/// Returns an independent request over the shared body buffer. Headers,
	/// trailers and URI are deep copies; the body is a fresh reader.
	pub fn clone_request(&self, options: &[RequestOption]) -> Request {
		let mut req = Request::new(Body::from(self.data.clone()));
		*req.method_mut() = self.request.method().clone();
		*req.uri_mut() = self.request.uri().clone();
		*req.version_mut() = self.request.version();
		*req.headers_mut() = self.request.headers().clone();
		for option in options {
			option.apply(&mut req);
		}
		req
	}

	/// Like [`Self::clone_request`] but carries the shadow-level state too.
	pub fn clone_shadow(&self) -> ShadowRequest {
		ShadowRequest {
			request: self.clone_request(&[]),
			data: self.data.clone(),
			trailers: self.trailers.clone(),
			form: self.form.clone(),
			multipart: self.multipart.clone(),
			route_values: self.route_values.clone(),
		}
	}

	/// Populates `form` from the query string and, for url-encoded bodies,
	/// from the body buffer.
	pub fn parse_form(&mut self) {
		let mut form = Form::new();
		if let Some(query) = self.request.uri().query() {
			collect_pairs(query.as_bytes(), &mut form);
		}
		let urlencoded = self
			.request
			.headers()
			.get(header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
		if urlencoded {
			collect_pairs(&self.data, &mut form);
		}
		self.form = Some(form);
	}

	pub fn method(&self) -> &Method {
		self.request.method()
	}

	pub fn uri(&self) -> &Uri {
		self.request.uri()
	}

	pub fn uri_mut(&mut self) -> &mut Uri {
		self.request.uri_mut()
	}

	pub fn headers(&self) -> &HeaderMap {
		self.request.headers()
	}

	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		self.request.headers_mut()
	}

	pub fn trailers(&self) -> &HeaderMap {
		&self.trailers
	}

	pub fn trailers_mut(&mut self) -> &mut HeaderMap {
		&mut self.trailers
	}

	pub fn form(&self) -> Option<&Form> {
		self.form.as_ref()
	}

	pub fn set_form(&mut self, form: Option<Form>) {
		self.form = form;
	}

	pub fn multipart(&self) -> Option<&MultipartForm> {
		self.multipart.as_ref()
	}

	pub fn set_multipart(&mut self, multipart: Option<MultipartForm>) {
		self.multipart = multipart;
	}

	/// The canonical body buffer. Reading it never consumes the request.
	pub fn body_bytes(&self) -> &Bytes {
		&self.data
	}
}

fn collect_pairs(raw: &[u8], form: &mut Form) {
	for (k, v) in url::form_urlencoded::parse(raw) {
		form.entry(k.into_owned()).or_default().push(v.into_owned());
	}
}

/// The response-side mirror of [`ShadowRequest`].
pub struct ShadowResponse {
	response: Response,
	data: Bytes,
	trailers: HeaderMap,
}

impl ShadowResponse {
	pub async fn new(response: Response) -> Result<ShadowResponse, Error> {
		let (parts, body) = response.into_parts();
		let (data, trailers) = super::buffer_body(body).await?;
		Ok(ShadowResponse {
			response: Response::from_parts(parts, Body::from(data.clone())),
			data,
			trailers,
		})
	}

	pub fn from_parts(status: StatusCode, headers: HeaderMap, data: Bytes) -> ShadowResponse {
		let mut response = Response::new(Body::from(data.clone()));
		*response.status_mut() = status;
		*response.headers_mut() = headers;
		ShadowResponse {
			response,
			data,
			trailers: HeaderMap::new(),
		}
	}

	pub fn reset(&mut self) {
		*self.response.body_mut() = Body::from(self.data.clone());
	}

	pub fn replace_body(&mut self, data: Bytes) {
		self.data = data;
		self.reset();
	}

	pub fn clone_response(&self) -> Response {
		let mut res = Response::new(Body::from(self.data.clone()));
		*res.status_mut() = self.response.status();
		*res.version_mut() = self.response.version();
		*res.headers_mut() = self.response.headers().clone();
		res
	}

	/// Lifts the response into a request (headers, trailers and body carried
	/// over; URI and method left empty) so downstream callers can treat an
	/// upstream response as the current request.
	pub fn create_request(&self) -> ShadowRequest {
		let mut req =
			ShadowRequest::from_parts(Method::GET, Uri::default(), self.response.headers().clone(), self.data.clone());
		req.trailers = self.trailers.clone();
		req
	}

	/// Finalizes the shadow for the client: the canonical buffer becomes the
	/// body and any stale `Content-Length` from merging is dropped.
	pub fn write(mut self) -> Response {
		self.response.headers_mut().remove(header::CONTENT_LENGTH);
		*self.response.body_mut() = Body::from(self.data.clone());
		self.response
	}

	pub fn status(&self) -> StatusCode {
		self.response.status()
	}

	pub fn set_status(&mut self, status: StatusCode) {
		*self.response.status_mut() = status;
	}

	pub fn headers(&self) -> &HeaderMap {
		self.response.headers()
	}

	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		self.response.headers_mut()
	}

	pub fn trailers(&self) -> &HeaderMap {
		&self.trailers
	}

	pub fn trailers_mut(&mut self) -> &mut HeaderMap {
		&mut self.trailers
	}

	pub fn body_bytes(&self) -> &Bytes {
		&self.data
	}
}
