use hyper_util::client::legacy;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use once_cell::sync::Lazy;
use tracing::trace;

use crate::http::{Body, Request, Response};
use crate::proxy::GatewayError;

/// Outbound HTTP client. One instance serves the whole process; connection
/// pooling lives inside the legacy hyper client.
#[derive(Clone)]
pub struct Client {
	client: legacy::Client<HttpConnector, Body>,
}

static SHARED: Lazy<Client> = Lazy::new(Client::new);

pub fn shared() -> &'static Client {
	&SHARED
}

impl Client {
	pub fn new() -> Client {
		let mut connector = HttpConnector::new();
		connector.enforce_http(false);
		let client = legacy::Client::builder(TokioExecutor::new()).build(connector);
		Client { client }
	}

	/// Issues the request as-is. Transport failures map to PROXY errors; the
	/// response body is re-wrapped into the crate's body type untouched.
	pub async fn simple_call(&self, req: Request) -> Result<Response, GatewayError> {
		trace!(uri = %req.uri(), method = %req.method(), "dialing upstream");
		let res = self
			.client
			.request(req)
			.await
			.map_err(|err| GatewayError::Proxy(err.to_string()))?;
		Ok(res.map(Body::new))
	}
}

impl Default for Client {
	fn default() -> Self {
		Self::new()
	}
}
