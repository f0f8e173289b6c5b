use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::bus;
use crate::callers::nats::fan_out;
use crate::callers::{FilterSettings, classify};
use crate::cascade::{Caller, Level, Verdict, sort};
use crate::http::shadow::ShadowRequest;
use crate::http::updaters::{RequestUpdater, ResponseUpdater};
use crate::proxy::GatewayError;
use crate::router::RouteValues;

/// Queue-backed request-reply over JetStream. Reply correlation is
/// indirected through the reflector channel: the published message names the
/// reflector and the per-request inbox in its headers, and the host's
/// reflector subscription (installed once, at startup) routes the worker's
/// reply back onto the inbox.
pub struct DurableBusCaller {
	settings: FilterSettings,
	host: String,
	subject: String,
	children: Vec<Arc<dyn Caller>>,
}

impl DurableBusCaller {
	pub async fn new(
		settings: FilterSettings,
		addr: &url::Url,
		children: Vec<Arc<dyn Caller>>,
	) -> anyhow::Result<DurableBusCaller> {
		let host = bus::host_of(addr);
		let subject = bus::subject_of(addr);
		bus::ensure_stream(&host, &subject).await?;
		bus::ensure_reflector(&host).await?;
		Ok(DurableBusCaller {
			settings,
			host,
			subject,
			children: sort(children),
		})
	}
}

#[async_trait]
impl Caller for DurableBusCaller {
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
		let js = jetstream::new(client.clone());
		let inbox = client.new_inbox();
		let mut sub = client
			.subscribe(inbox.clone())
			.await
			.map_err(GatewayError::internal)?;
		sub
			.unsubscribe_after(1)
			.await
			.map_err(GatewayError::internal)?;
		let (mut headers, payload) = bus::request_to_message(current);
		headers.insert(bus::HEADER_REFLECTOR, bus::REFLECTOR_CHANNEL);
		headers.insert(bus::HEADER_REPLY, inbox.as_str());
		let ack = js
			.publish_with_headers(self.subject.clone(), headers, payload)
			.await
			.map_err(|err| GatewayError::Proxy(err.to_string()))?;
		ack
			.await
			.map_err(|err| GatewayError::Proxy(err.to_string()))?;
		let Some(msg) = sub.next().await else {
			return Err(GatewayError::Internal("reply subscription closed".to_string()));
		};
		let res = bus::message_to_response(msg.headers.as_ref(), msg.payload);
		fan_out(&self.settings.name, &self.children, &res);
		classify(res.write())
	}
}
