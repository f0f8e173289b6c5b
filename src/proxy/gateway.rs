use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::http::{Body, HeaderValue, Request, Response, StatusCode, header};
use crate::proxy::{GatewayError, Handler};
use crate::router::{RouteTable, RouteValues};

#[cfg(test)]
#[path = "gateway_test.rs"]
mod tests;

/// Listener-level deadlines, mirrored from the original server settings.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

const WILDCARD_METHODS: [&str; 5] = ["GET", "HEAD", "POST", "PUT", "DELETE"];

#[derive(Debug, Clone)]
pub struct CorsPolicy {
	pub origins: String,
	pub headers: String,
	pub methods: String,
	pub expose_headers: String,
	pub max_age: String,
}

impl Default for CorsPolicy {
	fn default() -> CorsPolicy {
		CorsPolicy {
			origins: "*".to_string(),
			headers: "*".to_string(),
			methods: "GET, DELETE, OPTIONS, POST, PUT".to_string(),
			expose_headers: "*".to_string(),
			max_age: "3628800".to_string(),
		}
	}
}

pub enum RegisterOption {
	Cors(CorsPolicy),
}

/// Answers the CORS preflight for a route.
struct PreflightHandler {
	policy: CorsPolicy,
}

#[async_trait]
impl Handler for PreflightHandler {
	async fn handle(&self, _req: Request, _rv: RouteValues) -> Response {
		let mut builder = ::http::Response::builder().status(StatusCode::OK);
		for (name, value) in [
			("access-control-allow-origin", &self.policy.origins),
			("access-control-allow-headers", &self.policy.headers),
			("access-control-max-age", &self.policy.max_age),
			("access-control-allow-methods", &self.policy.methods),
		] {
			builder = builder.header(name, value);
		}
		builder
			.body(Body::empty())
			.unwrap_or_else(|_| GatewayError::Internal("invalid CORS policy".to_string()).into_response())
	}
}

/// Wraps a route handler so every response exposes the configured headers.
struct CorsHandler {
	inner: Arc<dyn Handler>,
	expose_headers: HeaderValue,
}

#[async_trait]
impl Handler for CorsHandler {
	async fn handle(&self, req: Request, rv: RouteValues) -> Response {
		let mut res = self.inner.handle(req, rv).await;
		res
			.headers_mut()
			.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, self.expose_headers.clone());
		res
	}
}

/// Binds `pattern` to `handler` for `method`. An empty method or `*` expands
/// to GET/HEAD/POST/PUT/DELETE; registration options may add side handlers
/// (CORS preflight) and wrap the main one.
pub fn handle_func(
	table: &RouteTable,
	pattern: &str,
	method: &str,
	handler: Arc<dyn Handler>,
	options: &[RegisterOption],
) -> anyhow::Result<()> {
	let mut handler = handler;
	for option in options {
		match option {
			RegisterOption::Cors(policy) => {
				table.register(pattern, "OPTIONS", Arc::new(PreflightHandler { policy: policy.clone() }));
				let expose_headers = HeaderValue::from_str(&policy.expose_headers)
					.map_err(|err| anyhow::anyhow!("invalid CORS expose headers: {err}"))?;
				handler = Arc::new(CorsHandler {
					inner: handler,
					expose_headers,
				});
			},
		}
	}
	let method = if method.is_empty() { "*" } else { method };
	if method == "*" {
		for method in WILDCARD_METHODS {
			table.register(pattern, method, handler.clone());
		}
		return Ok(());
	}
	table.register(pattern, method, handler);
	Ok(())
}

pub struct Gateway {
	listener: TcpListener,
}

impl Gateway {
	pub async fn bind(addr: &str) -> anyhow::Result<Gateway> {
		let listener = TcpListener::bind(addr).await?;
		Ok(Gateway { listener })
	}

	pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	/// Accept loop. Each connection is served on its own task with upgrade
	/// support; exchanges are routed through the table.
	pub async fn serve(self, table: &'static RouteTable) -> anyhow::Result<()> {
		info!(addr = %self.listener.local_addr()?, "gateway listening");
		loop {
			let (stream, peer) = self.listener.accept().await?;
			tokio::spawn(async move {
				let io = TokioIo::new(stream);
				let service = service_fn(move |req: ::http::Request<Incoming>| async move {
					Ok::<_, std::convert::Infallible>(dispatch(table, req).await)
				});
				let conn = hyper::server::conn::http1::Builder::new()
					.header_read_timeout(READ_TIMEOUT)
					.serve_connection(io, service)
					.with_upgrades();
				if let Err(err) = conn.await {
					debug!(%peer, "connection error: {err}");
				}
			});
		}
	}
}

pub async fn dispatch(table: &RouteTable, req: ::http::Request<Incoming>) -> Response {
	let req = req.map(Body::new);
	let (handler, rv) = match table.find(req.uri().path(), req.method().as_str()) {
		Ok(found) => found,
		Err(err) => return GatewayError::from(err).into_response(),
	};
	match tokio::time::timeout(WRITE_TIMEOUT, handler.handle(req, rv)).await {
		Ok(res) => res,
		Err(_) => GatewayError::Timeout.into_response(),
	}
}
