use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::callers::http::ProxyCaller;
use crate::cascade::{Caller, cascade, sort};
use crate::http::shadow::ShadowRequest;
use crate::http::{Body, Request, Response, Uri};
use crate::proxy::{GatewayError, Handler};
use crate::router::RouteValues;

#[cfg(test)]
#[path = "httpproxy_test.rs"]
mod tests;

/// Terminates one HTTP exchange: builds the shadow request, runs the sorted
/// cascade (the outbound proxy is the main-level caller within it) and
/// writes the accumulated response back.
pub struct HttpProxy {
	callers: Vec<Arc<dyn Caller>>,
}

impl HttpProxy {
	pub fn new(backend: Uri, callers: Vec<Arc<dyn Caller>>) -> HttpProxy {
		let mut callers = callers;
		callers.push(Arc::new(ProxyCaller::new(backend)));
		HttpProxy {
			callers: sort(callers),
		}
	}
}

#[async_trait]
impl Handler for HttpProxy {
	async fn handle(&self, req: Request, rv: RouteValues) -> Response {
		debug!(uri = %req.uri(), method = %req.method(), "handling request");
		let mut shadow = match ShadowRequest::new(req).await {
			Ok(shadow) => shadow,
			Err(err) => return GatewayError::internal(err).into_response(),
		};
		shadow.route_values = rv;
		match cascade(&mut shadow, &self.callers).await {
			Ok(Some(out)) => out.write(),
			Ok(None) => Response::new(Body::empty()),
			Err(err) => {
				debug!("cascade failed: {err}");
				err.into_response()
			},
		}
	}
}
