use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_nats::jetstream;
use bytes::Bytes;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::http::shadow::{ShadowRequest, ShadowResponse};
use crate::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use crate::proxy::GatewayError;

#[cfg(test)]
#[path = "bus_test.rs"]
mod tests;

/// Well-known channel that demultiplexes durable replies back to ephemeral
/// inboxes.
pub const REFLECTOR_CHANNEL: &str = "$ICEBERG.DURABLE";
pub const REFLECTOR_STREAM: &str = "ICEBERG-DURABLE";

pub const HEADER_PATH: &str = "Path";
pub const HEADER_QUERY: &str = "Query";
pub const HEADER_STATUS: &str = "Status";
pub const HEADER_REFLECTOR: &str = "Reflector";
pub const HEADER_REPLY: &str = "Reply";

/// Process-wide client pool keyed by host. Populated lazily, never evicted.
/// Connects happen outside the lock; a racing connect keeps the first entry.
static CLIENTS: Lazy<RwLock<HashMap<String, async_nats::Client>>> = Lazy::new(Default::default);

/// Hosts whose reflector subscription is already installed.
static REFLECTORS: Lazy<RwLock<HashSet<String>>> = Lazy::new(Default::default);

/// JetStream KV handles keyed by `host/bucket`.
static KV_STORES: Lazy<RwLock<HashMap<String, jetstream::kv::Store>>> = Lazy::new(Default::default);

pub async fn client(host: &str) -> Result<async_nats::Client, GatewayError> {
	if let Some(client) = CLIENTS.read().get(host) {
		return Ok(client.clone());
	}
	let client = async_nats::connect(host)
		.await
		.map_err(GatewayError::internal)?;
	let mut clients = CLIENTS.write();
	Ok(clients.entry(host.to_string()).or_insert(client).clone())
}

/// Fetches (creating on first use) the KV bucket backing a cache. The TTL is
/// a bucket-level property, applied when the bucket is first created.
pub async fn kv_store(host: &str, bucket: &str, ttl: Duration) -> Result<jetstream::kv::Store, GatewayError> {
	let key = format!("{host}/{bucket}");
	if let Some(store) = KV_STORES.read().get(&key) {
		return Ok(store.clone());
	}
	let client = client(host).await?;
	let js = jetstream::new(client);
	let store = match js
		.create_key_value(jetstream::kv::Config {
			bucket: bucket.to_string(),
			max_age: ttl,
			..Default::default()
		})
		.await
	{
		Ok(store) => store,
		Err(_) => js
			.get_key_value(bucket)
			.await
			.map_err(GatewayError::internal)?,
	};
	let mut stores = KV_STORES.write();
	Ok(stores.entry(key).or_insert(store).clone())
}

/// Makes sure a durable stream covers `subject` before anything publishes to
/// it. Stream names cannot contain dots, so the subject is mangled.
pub async fn ensure_stream(host: &str, subject: &str) -> Result<(), GatewayError> {
	let client = client(host).await?;
	let js = jetstream::new(client);
	js.get_or_create_stream(jetstream::stream::Config {
		name: subject.replace('.', "-"),
		subjects: vec![subject.to_string()],
		..Default::default()
	})
	.await
	.map_err(GatewayError::internal)?;
	Ok(())
}

/// Installs the reflector for a bus host: a long-lived durable consumer on
/// the reflector channel that rewrites each message's subject to its `Reply`
/// header, strips that header and re-publishes, thereby routing durable
/// replies back to per-request inboxes. Idempotent per host.
pub async fn ensure_reflector(host: &str) -> Result<(), GatewayError> {
	if REFLECTORS.read().contains(host) {
		return Ok(());
	}
	let client = client(host).await?;
	let js = jetstream::new(client.clone());
	let stream = js
		.get_or_create_stream(jetstream::stream::Config {
			name: REFLECTOR_STREAM.to_string(),
			subjects: vec![REFLECTOR_CHANNEL.to_string()],
			..Default::default()
		})
		.await
		.map_err(GatewayError::internal)?;
	let consumer = stream
		.get_or_create_consumer(
			"iceberg-reflector",
			jetstream::consumer::pull::Config {
				durable_name: Some("iceberg-reflector".to_string()),
				..Default::default()
			},
		)
		.await
		.map_err(GatewayError::internal)?;
	{
		let mut installed = REFLECTORS.write();
		if !installed.insert(host.to_string()) {
			return Ok(());
		}
	}
	let host = host.to_string();
	tokio::spawn(async move {
		loop {
			let mut messages = match consumer.messages().await {
				Ok(messages) => messages,
				Err(err) => {
					error!(host = %host, "reflector consumer failed: {err}");
					tokio::time::sleep(Duration::from_secs(1)).await;
					continue;
				},
			};
			while let Some(message) = messages.next().await {
				let message = match message {
					Ok(message) => message,
					Err(err) => {
						warn!(host = %host, "reflector read failed: {err}");
						break;
					},
				};
				if let Err(err) = reflect(&client, &message).await {
					warn!(host = %host, "reflection failed: {err}");
				}
				if let Err(err) = message.ack().await {
					warn!(host = %host, "reflector ack failed: {err}");
				}
			}
		}
	});
	Ok(())
}

async fn reflect(client: &async_nats::Client, message: &jetstream::Message) -> Result<(), GatewayError> {
	let Some(headers) = message.headers.as_ref() else {
		debug!("reflected message without headers, dropping");
		return Ok(());
	};
	let Some((reply, headers)) = strip_reply(headers) else {
		debug!("reflected message without a reply header, dropping");
		return Ok(());
	};
	client
		.publish_with_headers(reply, headers, message.payload.clone())
		.await
		.map_err(GatewayError::internal)
}

/// Splits the `Reply` header off a message's header set, returning the reply
/// subject and the remaining headers.
pub fn strip_reply(headers: &async_nats::HeaderMap) -> Option<(String, async_nats::HeaderMap)> {
	let reply = headers.get(HEADER_REPLY)?.to_string();
	let mut rest = async_nats::HeaderMap::new();
	for (name, values) in headers.iter() {
		if name.to_string().eq_ignore_ascii_case(HEADER_REPLY) {
			continue;
		}
		for value in values {
			rest.append(name.to_string(), value.to_string());
		}
	}
	Some((reply, rest))
}

/// Projects a shadow request onto the bus wire format: payload = body bytes,
/// headers mirror the HTTP headers plus `Path` and `Query`.
pub fn request_to_message(req: &ShadowRequest) -> (async_nats::HeaderMap, Bytes) {
	let mut headers = async_nats::HeaderMap::new();
	for (name, value) in req.headers() {
		let Ok(value) = value.to_str() else {
			debug!(header = %name, "skipping non-ascii header on bus message");
			continue;
		};
		headers.append(name.as_str(), value);
	}
	headers.append(HEADER_PATH, req.uri().path());
	headers.append(HEADER_QUERY, req.uri().query().unwrap_or_default());
	(headers, req.body_bytes().clone())
}

/// Lifts a bus reply into a synthetic HTTP response. The `Status` header
/// (decimal) selects the status code: absent means 200, unparseable falls
/// through to 418.
pub fn message_to_response(headers: Option<&async_nats::HeaderMap>, payload: Bytes) -> ShadowResponse {
	let mut header_map = HeaderMap::new();
	let mut status = StatusCode::OK;
	if let Some(headers) = headers {
		for (name, values) in headers.iter() {
			for value in values {
				let (Ok(name), Ok(value)) = (
					HeaderName::try_from(name.to_string()),
					HeaderValue::from_str(value.as_str()),
				) else {
					continue;
				};
				header_map.append(name, value);
			}
		}
		if let Some(raw) = headers.get(HEADER_STATUS) {
			status = raw
				.as_str()
				.parse::<u16>()
				.ok()
				.and_then(|code| StatusCode::from_u16(code).ok())
				.unwrap_or(StatusCode::IM_A_TEAPOT);
		}
	}
	ShadowResponse::from_parts(status, header_map, payload)
}

/// Derives the bus subject from a caller address: the URL path minus its
/// leading slash.
pub fn subject_of(url: &url::Url) -> String {
	url.path().trim_start_matches('/').to_string()
}

/// The authority portion of a bus address, used as the pool key.
pub fn host_of(url: &url::Url) -> String {
	let host = url.host_str().unwrap_or_default();
	match url.port() {
		Some(port) => format!("{host}:{port}"),
		None => host.to_string(),
	}
}
