use std::time::Duration;

use async_trait::async_trait;

use crate::callers::{FilterSettings, classify};
use crate::cascade::{Caller, DEFAULT_CALL_TIMEOUT, Level, Verdict};
use crate::client;
use crate::http::shadow::{RequestOption, ShadowRequest};
use crate::http::updaters::{RequestUpdater, ResponseUpdater};
use crate::http::{Uri, x_headers};
use crate::proxy::GatewayError;
use crate::router::RouteValues;

/// Filter that forwards the current request to an auxiliary HTTP service.
pub struct HttpCaller {
	settings: FilterSettings,
	target: Uri,
}

impl HttpCaller {
	pub fn new(settings: FilterSettings, addr: &url::Url) -> anyhow::Result<HttpCaller> {
		let target = Uri::try_from(addr.as_str())?;
		Ok(HttpCaller { settings, target })
	}
}

#[async_trait]
impl Caller for HttpCaller {
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
		let req = current.clone_request(&[RequestOption::WithUri(self.target.clone())]);
		let res = client::shared().simple_call(req).await?;
		classify(res)
	}
}

/// The outbound proxy itself, expressed as the cascade's main-level caller.
/// It wholesale replaces the accumulating response and mirrors the request
/// id onto it.
pub struct ProxyCaller {
	target: Uri,
	timeout: Duration,
}

impl ProxyCaller {
	pub fn new(target: Uri) -> ProxyCaller {
		ProxyCaller {
			target,
			timeout: DEFAULT_CALL_TIMEOUT,
		}
	}
}

#[async_trait]
impl Caller for ProxyCaller {
	fn level(&self) -> Level {
		Level::NONE
	}

	fn name(&self) -> &str {
		"proxy"
	}

	fn timeout(&self) -> Duration {
		self.timeout
	}

	fn request_updaters(&self) -> Vec<RequestUpdater> {
		vec![
			RequestUpdater::ReplaceBody,
			RequestUpdater::ReplaceHeader,
			RequestUpdater::ReplaceTrailer,
		]
	}

	fn response_updaters(&self) -> Vec<ResponseUpdater> {
		vec![
			ResponseUpdater::ReplaceBody,
			ResponseUpdater::ReplaceHeader,
			ResponseUpdater::ReplaceTrailer,
		]
	}

	async fn call(
		&self,
		_rv: &RouteValues,
		current: &ShadowRequest,
		_original: &ShadowRequest,
	) -> Result<Verdict, GatewayError> {
		let req = current.clone_request(&[RequestOption::WithUri(self.target.clone())]);
		let request_id = req.headers().get(x_headers::X_REQUEST_ID).cloned();
		let mut res = client::shared().simple_call(req).await?;
		if let Some(id) = request_id {
			res.headers_mut().append(x_headers::X_REQUEST_ID, id);
		}
		classify(res)
	}
}
