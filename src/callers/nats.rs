use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::warn;

use crate::bus;
use crate::callers::{FilterSettings, classify};
use crate::cascade::{Caller, Level, Verdict, cascade, sort};
use crate::http::shadow::{ShadowRequest, ShadowResponse};
use crate::http::updaters::{RequestUpdater, ResponseUpdater};
use crate::proxy::GatewayError;
use crate::router::RouteValues;

/// Best-effort request-reply over core NATS: an ephemeral inbox subscription
/// (installed before publish, auto-unsubscribed after one message) catches
/// the first reply, which lifts to a synthetic HTTP response.
pub struct CoreBusCaller {
	settings: FilterSettings,
	host: String,
	subject: String,
	children: Vec<Arc<dyn Caller>>,
}

impl CoreBusCaller {
	pub async fn new(
		settings: FilterSettings,
		addr: &url::Url,
		children: Vec<Arc<dyn Caller>>,
	) -> anyhow::Result<CoreBusCaller> {
		let host = bus::host_of(addr);
		let subject = bus::subject_of(addr);
		bus::client(&host).await?;
		Ok(CoreBusCaller {
			settings,
			host,
			subject,
			children: sort(children),
		})
	}
}

#[async_trait]
impl Caller for CoreBusCaller {
	fn level(&self) -> Level {
		self.settings.level
	}

	fn is_parallel(&self) -> bool {
		self.settings.parallel
	}

	fn name(&self) -> &str {
		&self.settings.name
	}

	fn await_list(&self) -> &[String] {
		&self.settings.await_list
	}

	fn timeout(&self) -> Duration {
		self.settings.timeout
	}

	fn request_updaters(&self) -> Vec<RequestUpdater> {
		self.settings.request_updaters.clone()
	}

	fn response_updaters(&self) -> Vec<ResponseUpdater> {
		self.settings.response_updaters.clone()
	}

	async fn call(
		&self,
		_rv: &RouteValues,
		current: &ShadowRequest,
		_original: &ShadowRequest,
	) -> Result<Verdict, GatewayError> {
		let client = bus::client(&self.host).await?;
		let inbox = client.new_inbox();
		let mut sub = client
			.subscribe(inbox.clone())
			.await
			.map_err(GatewayError::internal)?;
		sub
			.unsubscribe_after(1)
			.await
			.map_err(GatewayError::internal)?;
		let (headers, payload) = bus::request_to_message(current);
		client
			.publish_with_reply_and_headers(self.subject.clone(), inbox, headers, payload)
			.await
			.map_err(|err| GatewayError::Proxy(err.to_string()))?;
		client.flush().await.map_err(GatewayError::internal)?;
		let Some(msg) = sub.next().await else {
			return Err(GatewayError::Internal("reply subscription closed".to_string()));
		};
		let res = bus::message_to_response(msg.headers.as_ref(), msg.payload);
		fan_out(&self.settings.name, &self.children, &res);
		classify(res.write())
	}
}

/// Runs the caller's children on a second cascade seeded from the reply,
/// fire-and-forget: errors are logged and discarded.
pub(crate) fn fan_out(name: &str, children: &[Arc<dyn Caller>], res: &ShadowResponse) {
	if children.is_empty() {
		return;
	}
	let name = name.to_string();
	let mut req = res.create_request();
	let children = children.to_vec();
	tokio::spawn(async move {
		if let Err(err) = cascade(&mut req, &children).await {
			warn!(caller = %name, "callback cascade failed: {err}");
		}
	});
}
