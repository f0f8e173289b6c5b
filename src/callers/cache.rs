use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::bus;
use crate::cascade::{Caller, Level, Verdict};
use crate::http::shadow::ShadowRequest;
use crate::http::{Body, HeaderMap, HeaderName, HeaderValue, Response};
use crate::proxy::GatewayError;
use crate::router::RouteValues;

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;

/// A cache is a pair of callers over one JetStream KV bucket: `Get` at the
/// `pre` level short-circuits on a hit, `Set` at the `post` level writes the
/// accumulated exchange back under the same key.
struct JetStreamCache {
	store: kv::Store,
	template: String,
}

pub struct CacheGet {
	cache: Arc<JetStreamCache>,
}

pub struct CacheSet {
	cache: Arc<JetStreamCache>,
}

pub async fn build(
	addr: &url::Url,
	ttl: Duration,
	template: String,
) -> anyhow::Result<(Arc<dyn Caller>, Arc<dyn Caller>)> {
	if addr.scheme() != "jetstream" {
		bail!("unsupported cache scheme {}", addr.scheme());
	}
	let host = bus::host_of(addr);
	let bucket = addr.path().trim_start_matches('/').to_string();
	let store = bus::kv_store(&host, &bucket, ttl).await?;
	let cache = Arc::new(JetStreamCache { store, template });
	Ok((
		Arc::new(CacheGet { cache: cache.clone() }),
		Arc::new(CacheSet { cache }),
	))
}

#[async_trait]
impl Caller for CacheGet {
	fn level(&self) -> Level {
		Level::PRE
	}

	fn name(&self) -> &str {
		"cache"
	}

	async fn call(
		&self,
		rv: &RouteValues,
		_current: &ShadowRequest,
		original: &ShadowRequest,
	) -> Result<Verdict, GatewayError> {
		let key = parse_key(&self.cache.template, original, rv);
		match self.cache.store.get(&key).await {
			Ok(Some(value)) => {
				let (headers, body) = unmarshal(&value)?;
				let mut res = Response::new(Body::from(body));
				*res.headers_mut() = headers;
				Ok(Verdict::Term(Some(res)))
			},
			Ok(None) => Ok(Verdict::Continue(None)),
			Err(err) => {
				warn!(key = %key, "cache lookup failed: {err}");
				Ok(Verdict::Continue(None))
			},
		}
	}
}

#[async_trait]
impl Caller for CacheSet {
	fn level(&self) -> Level {
		Level::POST
	}

	fn name(&self) -> &str {
		"cache"
	}

	async fn call(
		&self,
		rv: &RouteValues,
		current: &ShadowRequest,
		original: &ShadowRequest,
	) -> Result<Verdict, GatewayError> {
		let key = parse_key(&self.cache.template, original, rv);
		let value = marshal(current.headers(), current.body_bytes())?;
		if let Err(err) = self.cache.store.put(&key, value.into()).await {
			warn!(key = %key, "cache store failed: {err}");
		}
		Ok(Verdict::Continue(None))
	}
}

/// Expands a key template against one request. The template is lowercased
/// first; replacements are inserted verbatim. `{:name}` takes a route value,
/// `{?name}` the query values joined by `-`, `{body}` the lowercase hex
/// SHA-256 of the body bytes, `{method}` the request method.
pub fn parse_key(template: &str, req: &ShadowRequest, rv: &RouteValues) -> String {
	let mut key = template.to_lowercase();
	for (name, value) in rv {
		key = key.replace(&format!("{{:{}}}", name.to_lowercase()), value);
	}
	if key.contains("{?") {
		let mut query: HashMap<String, Vec<String>> = HashMap::new();
		for (name, value) in url::form_urlencoded::parse(req.uri().query().unwrap_or_default().as_bytes()) {
			query.entry(name.into_owned()).or_default().push(value.into_owned());
		}
		for (name, values) in query {
			key = key.replace(&format!("{{?{}}}", name.to_lowercase()), &values.join("-"));
		}
	}
	if key.contains("{body}") {
		let digest = Sha256::digest(req.body_bytes());
		key = key.replace("{body}", &hex::encode(digest));
	}
	if key.contains("{method}") {
		key = key.replace("{method}", req.method().as_str());
	}
	key
}

/// The serialized cache entry: a deterministic encoding of the header set
/// and body bytes. BTreeMap keeps the key order stable.
#[derive(Serialize, Deserialize)]
struct Envelope {
	header: BTreeMap<String, Vec<String>>,
	body: Vec<u8>,
}

pub fn marshal(headers: &HeaderMap, body: &[u8]) -> Result<Vec<u8>, GatewayError> {
	let mut header = BTreeMap::<String, Vec<String>>::new();
	for (name, value) in headers {
		let Ok(value) = value.to_str() else { continue };
		header
			.entry(name.as_str().to_string())
			.or_default()
			.push(value.to_string());
	}
	bincode::serialize(&Envelope {
		header,
		body: body.to_vec(),
	})
	.map_err(GatewayError::internal)
}

pub fn unmarshal(data: &[u8]) -> Result<(HeaderMap, Bytes), GatewayError> {
	let envelope: Envelope = bincode::deserialize(data).map_err(GatewayError::internal)?;
	let mut headers = HeaderMap::new();
	for (name, values) in envelope.header {
		let Ok(name) = HeaderName::try_from(name.as_str()) else {
			continue;
		};
		for value in values {
			let Ok(value) = HeaderValue::from_str(&value) else {
				continue;
			};
			headers.append(name.clone(), value);
		}
	}
	Ok((headers, Bytes::from(envelope.body)))
}
