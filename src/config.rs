use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::info;

use crate::callers;
use crate::callers::opa::{PolicyCaller, PolicyKind, PolicyScope};
use crate::cascade::{Caller, DEFAULT_CALL_TIMEOUT, Level};
use crate::http::Uri;
use crate::proxy::Handler;
use crate::proxy::gateway::{CorsPolicy, RegisterOption, handle_func};
use crate::proxy::httpproxy::HttpProxy;
use crate::proxy::websocket::WebSocketProxy;
use crate::router::{RouteTable, default_route_table};

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

#[derive(Debug, Deserialize)]
struct RawConfig {
	#[serde(rename = "apiVersion")]
	api_version: String,
	#[serde(default)]
	metadata: Metadata,
	spec: serde_yaml::Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct Metadata {
	#[serde(default)]
	pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SpecV1 {
	pub listen: String,
	#[serde(default)]
	pub resources: BTreeMap<String, ResourceV1>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceV1 {
	pub frontend: String,
	pub backend: String,
	#[serde(default)]
	pub method: String,
	#[serde(default, rename = "use")]
	pub uses: UseV1,
	#[serde(default)]
	pub filters: Vec<FilterV1>,
}

#[derive(Debug, Deserialize)]
pub struct FilterV1 {
	#[serde(default)]
	pub name: String,
	pub addr: String,
	#[serde(default)]
	pub level: Option<String>,
	#[serde(default)]
	pub timeout: Option<String>,
	#[serde(default, rename = "async")]
	pub parallel: bool,
	#[serde(default, rename = "await")]
	pub awaits: Vec<String>,
	#[serde(default)]
	pub exchange: Option<ExchangeV1>,
	#[serde(default)]
	pub next: Vec<FilterV1>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeV1 {
	#[serde(default)]
	pub headers: Vec<String>,
	#[serde(default)]
	pub body: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct UseV1 {
	#[serde(default)]
	pub cors: Option<CorsUseV1>,
	#[serde(default)]
	pub cache: Option<CacheV1>,
	#[serde(default)]
	pub opa: Option<OpaV1>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CorsUseV1 {
	Named(String),
	Custom(CorsV1),
}

#[derive(Debug, Deserialize)]
pub struct CorsV1 {
	#[serde(default)]
	pub origin: Option<String>,
	#[serde(default)]
	pub methods: Option<String>,
	#[serde(default, rename = "headersAllowed")]
	pub headers_allowed: Option<String>,
	#[serde(default, rename = "headersExposed")]
	pub headers_exposed: Option<String>,
	#[serde(default, rename = "maxAge")]
	pub max_age: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CacheV1 {
	pub addr: String,
	pub ttl: String,
	pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct OpaV1 {
	pub agent: String,
	#[serde(default)]
	pub http: Vec<PolicyEntryV1>,
	#[serde(default)]
	pub ws: OpaWsV1,
}

#[derive(Debug, Deserialize, Default)]
pub struct OpaWsV1 {
	#[serde(default)]
	pub send: Vec<PolicyEntryV1>,
	#[serde(default)]
	pub receive: Vec<PolicyEntryV1>,
}

/// A policy reference is either a bare name (remote by default) or a
/// `{name: local|remote}` map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PolicyEntryV1 {
	Name(String),
	Typed(BTreeMap<String, String>),
}

/// Parses the raw YAML and selects the spec version.
pub fn parse(contents: &str) -> anyhow::Result<(Metadata, SpecV1)> {
	let raw: RawConfig = serde_yaml::from_str(contents).context("invalid configuration")?;
	match raw.api_version.to_lowercase().as_str() {
		"apps/v1" => {
			let spec = SpecV1::deserialize(raw.spec).context("invalid spec")?;
			Ok((raw.metadata, spec))
		},
		other => bail!("unsupported version {other}"),
	}
}

/// Resolves every `[[VAR]]` host marker from the environment.
pub fn resolve_env_hosts(addr: &str) -> anyhow::Result<String> {
	let mut out = addr.to_string();
	while let Some(start) = out.find("[[") {
		let Some(end) = out[start..].find("]]").map(|i| start + i) else {
			bail!("unterminated [[ in address {addr}");
		};
		let name = &out[start + 2..end];
		let value =
			std::env::var(name).map_err(|_| anyhow::anyhow!("environment variable {name} is not set"))?;
		out.replace_range(start..end + 2, &value);
	}
	Ok(out)
}

/// `<integer><ms|s|m|h>`; anything else is a configuration error.
pub fn parse_timeout(timeout: Option<&str>) -> anyhow::Result<Duration> {
	let Some(timeout) = timeout.filter(|t| !t.is_empty()) else {
		return Ok(DEFAULT_CALL_TIMEOUT);
	};
	duration_str::parse(timeout).map_err(|err| anyhow::anyhow!("invalid timeout {timeout:?}: {err}"))
}

pub fn parse_level(level: &str) -> anyhow::Result<Level> {
	match level.to_lowercase().as_str() {
		"connect" => Ok(Level::CONNECT),
		"request" => Ok(Level::REQUEST),
		"response" => Ok(Level::RESPONSE),
		other => bail!("unsupported level {other}"),
	}
}

fn parse_policies(entries: &[PolicyEntryV1]) -> anyhow::Result<Vec<(String, PolicyKind)>> {
	let mut policies = Vec::with_capacity(entries.len());
	for entry in entries {
		match entry {
			PolicyEntryV1::Name(name) => policies.push((name.clone(), PolicyKind::Remote)),
			PolicyEntryV1::Typed(map) => {
				let Some((name, kind)) = map.iter().next() else {
					continue;
				};
				let kind = match kind.to_lowercase().as_str() {
					"local" => PolicyKind::Local,
					"remote" => PolicyKind::Remote,
					other => bail!("unsupported policy type {other}"),
				};
				policies.push((name.clone(), kind));
			},
		}
	}
	Ok(policies)
}

/// Builds the caller chain for one `filters:` list. Top-level filters carry
/// an explicit level; nested (`next:`) ones run at the main level of their
/// callback cascade.
fn build_filters<'a>(
	filters: &'a [FilterV1],
	supports_level: bool,
) -> BoxFuture<'a, anyhow::Result<Vec<Arc<dyn Caller>>>> {
	Box::pin(async move {
		let mut callers: Vec<Arc<dyn Caller>> = Vec::with_capacity(filters.len());
		for filter in filters {
			let addr = url::Url::parse(&resolve_env_hosts(&filter.addr)?)
				.with_context(|| format!("invalid filter address {:?}", filter.addr))?;
			let level = if supports_level {
				let level = filter
					.level
					.as_deref()
					.ok_or_else(|| anyhow::anyhow!("filter {:?} is missing a level", filter.name))?;
				parse_level(level)?
			} else {
				Level::NONE
			};
			let mut settings = callers::FilterSettings::new(filter.name.clone(), level);
			settings.parallel = filter.parallel;
			settings.await_list = filter.awaits.clone();
			settings.timeout = parse_timeout(filter.timeout.as_deref())?;
			if let Some(exchange) = &filter.exchange {
				if !exchange.headers.is_empty() {
					settings.set_exchange_headers(&exchange.headers)?;
				}
				if exchange.body {
					settings.set_exchange_body();
				}
			}
			let children = build_filters(&filter.next, false).await?;
			callers.push(callers::build(settings, addr, children).await?);
		}
		Ok(callers)
	})
}

fn cors_option(cors: &CorsUseV1) -> RegisterOption {
	let policy = match cors {
		CorsUseV1::Named(_) => CorsPolicy::default(),
		CorsUseV1::Custom(custom) => {
			let defaults = CorsPolicy::default();
			CorsPolicy {
				origins: custom.origin.clone().unwrap_or(defaults.origins),
				headers: custom.headers_allowed.clone().unwrap_or(defaults.headers),
				methods: custom.methods.clone().unwrap_or(defaults.methods),
				expose_headers: custom.headers_exposed.clone().unwrap_or(defaults.expose_headers),
				max_age: custom.max_age.clone().unwrap_or(defaults.max_age),
			}
		},
	};
	RegisterOption::Cors(policy)
}

/// Turns one resource into a registered route: policy callers first, then
/// the configured filters, then the cache pair; the backend scheme selects
/// the handler.
async fn build_resource(table: &RouteTable, name: &str, resource: &ResourceV1) -> anyhow::Result<()> {
	let backend = url::Url::parse(&resolve_env_hosts(&resource.backend)?)
		.with_context(|| format!("invalid backend for resource {name}"))?;

	let mut chain: Vec<Arc<dyn Caller>> = Vec::new();
	if let Some(opa) = &resource.uses.opa {
		let agent = url::Url::parse(&resolve_env_hosts(&opa.agent)?)
			.with_context(|| format!("invalid OPA agent for resource {name}"))?;
		let mut scopes: Vec<(&[PolicyEntryV1], PolicyScope)> = Vec::new();
		match backend.scheme() {
			"ws" | "wss" => {
				scopes.push((&opa.ws.send, PolicyScope::WsSend));
				scopes.push((&opa.ws.receive, PolicyScope::WsReceive));
			},
			_ => scopes.push((&opa.http, PolicyScope::Http)),
		}
		for (entries, scope) in scopes {
			let policies = parse_policies(entries)?;
			if policies.is_empty() {
				continue;
			}
			chain.push(Arc::new(PolicyCaller::new(&agent, name, policies, scope).await?));
		}
	}
	chain.extend(build_filters(&resource.filters, true).await?);
	if let Some(cache) = &resource.uses.cache {
		let addr = url::Url::parse(&resolve_env_hosts(&cache.addr)?)
			.with_context(|| format!("invalid cache address for resource {name}"))?;
		let ttl = parse_timeout(Some(cache.ttl.as_str()))?;
		let (get, set) = callers::cache::build(&addr, ttl, cache.key.clone()).await?;
		chain.push(get);
		chain.push(set);
	}

	let frontend = frontend_path(&resource.frontend);
	let handler: Arc<dyn Handler> = match backend.scheme() {
		"http" | "https" => {
			let target = Uri::try_from(backend.as_str())?;
			Arc::new(HttpProxy::new(target, chain))
		},
		"ws" | "wss" => Arc::new(WebSocketProxy::new(backend.clone(), chain)),
		other => bail!("unsupported backend protocol {other}"),
	};

	let mut options = Vec::new();
	if let Some(cors) = &resource.uses.cors {
		options.push(cors_option(cors));
	}
	handle_func(table, &frontend, &resource.method, handler, &options)?;
	info!(resource = %name, frontend = %frontend, backend = %backend, "route registered");
	Ok(())
}

/// A frontend may be a bare path template or a full URL; only the path
/// matters for routing.
fn frontend_path(frontend: &str) -> String {
	match url::Url::parse(frontend) {
		Ok(url) => url.path().to_string(),
		Err(_) => frontend.to_string(),
	}
}

/// Registers every resource into `table` and returns the listen address.
pub async fn bootstrap_with(table: &RouteTable, spec: &SpecV1) -> anyhow::Result<String> {
	for (name, resource) in &spec.resources {
		build_resource(table, name, resource).await?;
	}
	Ok(spec.listen.clone())
}

pub async fn bootstrap(spec: &SpecV1) -> anyhow::Result<String> {
	bootstrap_with(default_route_table(), spec).await
}
