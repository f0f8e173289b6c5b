pub mod cache;
pub mod http;
pub mod jetstream;
pub mod nats;
pub mod opa;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use crate::cascade::{Caller, DEFAULT_CALL_TIMEOUT, Level, Verdict};
use crate::http::updaters::{RequestUpdater, ResponseUpdater};
use crate::http::{HeaderName, Response, continue_on_error};
use crate::proxy::GatewayError;

/// Configuration shared by every filter-style caller: identity, placement,
/// parallelism and the updaters derived from its `exchange` block.
#[derive(Debug, Clone)]
pub struct FilterSettings {
	pub name: String,
	pub level: Level,
	pub parallel: bool,
	pub timeout: Duration,
	pub await_list: Vec<String>,
	pub request_updaters: Vec<RequestUpdater>,
	pub response_updaters: Vec<ResponseUpdater>,
}

impl FilterSettings {
	pub fn new(name: String, level: Level) -> FilterSettings {
		FilterSettings {
			name,
			level,
			parallel: false,
			timeout: DEFAULT_CALL_TIMEOUT,
			await_list: Vec::new(),
			request_updaters: Vec::new(),
			response_updaters: Vec::new(),
		}
	}

	/// `exchange.headers`: `["*"]` swaps the whole header set, anything else
	/// projects the listed keys. Request-phase levels exchange into the
	/// request, the response level into the accumulating response.
	pub fn set_exchange_headers(&mut self, headers: &[String]) -> anyhow::Result<()> {
		let replace = headers.len() == 1 && headers[0] == "*";
		if self.level.contains(Level::RESPONSE) {
			if replace {
				self.response_updaters.push(ResponseUpdater::ReplaceHeader);
			} else {
				self
					.response_updaters
					.push(ResponseUpdater::UpdateHeader(parse_keys(headers)?));
			}
		} else if replace {
			self.request_updaters.push(RequestUpdater::ReplaceHeader);
		} else {
			self
				.request_updaters
				.push(RequestUpdater::UpdateHeader(parse_keys(headers)?));
		}
		Ok(())
	}

	pub fn set_exchange_body(&mut self) {
		if self.level.contains(Level::RESPONSE) {
			self.response_updaters.push(ResponseUpdater::ReplaceBody);
		} else {
			self.request_updaters.push(RequestUpdater::ReplaceBody);
		}
	}
}

fn parse_keys(headers: &[String]) -> anyhow::Result<Vec<HeaderName>> {
	headers
		.iter()
		.map(|h| HeaderName::try_from(h.as_str()).map_err(|err| anyhow::anyhow!("invalid header name {h:?}: {err}")))
		.collect()
}

/// Builds a caller from its address scheme: `http(s)` dials over HTTP,
/// `nats` is the best-effort bus caller, `jetstream` the durable one.
pub async fn build(
	settings: FilterSettings,
	addr: url::Url,
	children: Vec<Arc<dyn Caller>>,
) -> anyhow::Result<Arc<dyn Caller>> {
	match addr.scheme() {
		"http" | "https" => Ok(Arc::new(http::HttpCaller::new(settings, &addr)?)),
		"nats" => Ok(Arc::new(nats::CoreBusCaller::new(settings, &addr, children).await?)),
		"jetstream" => Ok(Arc::new(
			jetstream::DurableBusCaller::new(settings, &addr, children).await?,
		)),
		other => bail!("unsupported scheme {other}"),
	}
}

/// Maps a caller's raw response onto the cascade: a non-success status stops
/// the exchange with that status, unless the response carries
/// `X-Continue-On-Error: true`.
pub fn classify(res: Response) -> Result<Verdict, GatewayError> {
	let status = res.status();
	if status.as_u16() >= 400 && !continue_on_error(res.headers()) {
		return Err(GatewayError::Filter {
			status,
			message: format!(
				"{} {}",
				status.as_u16(),
				status.canonical_reason().unwrap_or("unknown status")
			),
		});
	}
	Ok(Verdict::Continue(Some(res)))
}
