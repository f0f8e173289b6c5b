use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;

use crate::bus;
use crate::cascade::{Caller, Level, Verdict};
use crate::http::shadow::ShadowRequest;
use crate::http::StatusCode;
use crate::proxy::GatewayError;
use crate::router::RouteValues;

const POLICY_STORE_BUCKET: &str = "OPA_STORE";
const HEADER_POLICIES: &str = "X-Policies";
const HEADER_X_STATUS: &str = "X-Status";
const HEADER_X_ERROR: &str = "X-Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
	Local,
	Remote,
}

/// Which side of the exchange a policy set guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyScope {
	Http,
	WsSend,
	WsReceive,
}

/// Fronts an external OPA agent over core NATS. The agent receives the
/// request as a JSON document plus the policy names to evaluate; anything
/// but an `X-Status: 200` reply denies the exchange.
pub struct PolicyCaller {
	scope: PolicyScope,
	host: String,
	subject: String,
	policies: Vec<String>,
}

impl PolicyCaller {
	/// `local` policies are uploaded to the agent's policy bucket from the
	/// same-named environment variable at startup; `remote` ones are only
	/// referenced by name.
	pub async fn new(
		agent: &url::Url,
		app_name: &str,
		policies: Vec<(String, PolicyKind)>,
		scope: PolicyScope,
	) -> anyhow::Result<PolicyCaller> {
		let host = bus::host_of(agent);
		let subject = bus::subject_of(agent);
		let mut names = Vec::with_capacity(policies.len());
		for (policy, kind) in policies {
			match kind {
				PolicyKind::Remote => names.push(policy),
				PolicyKind::Local => {
					let name = format!("{app_name}_{policy}");
					let source = std::env::var(&policy)
						.map_err(|_| anyhow::anyhow!("local policy {policy} not present in environment"))?;
					let store = bus::kv_store(&host, POLICY_STORE_BUCKET, std::time::Duration::ZERO).await?;
					store.put(&name, source.into()).await?;
					names.push(name);
				},
			}
		}
		Ok(PolicyCaller {
			scope,
			host,
			subject,
			policies: names,
		})
	}
}

#[async_trait]
impl Caller for PolicyCaller {
	fn level(&self) -> Level {
		match self.scope {
			PolicyScope::Http | PolicyScope::WsSend => Level::REQUEST,
			PolicyScope::WsReceive => Level::RESPONSE,
		}
	}

	fn name(&self) -> &str {
		"opa"
	}

	async fn call(
		&self,
		rv: &RouteValues,
		current: &ShadowRequest,
		_original: &ShadowRequest,
	) -> Result<Verdict, GatewayError> {
		let mut headers = BTreeMap::<String, Vec<String>>::new();
		for (name, value) in current.headers() {
			let Ok(value) = value.to_str() else { continue };
			headers
				.entry(name.as_str().to_string())
				.or_default()
				.push(value.to_string());
		}
		let document = json!({
			"path": rv,
			"headers": headers,
			"method": current.method().as_str(),
			"data": STANDARD.encode(current.body_bytes()),
		});
		let payload = serde_json::to_vec(&document).map_err(GatewayError::internal)?;

		let client = bus::client(&self.host).await?;
		let mut message_headers = async_nats::HeaderMap::new();
		for policy in &self.policies {
			message_headers.append(HEADER_POLICIES, policy.as_str());
		}
		let reply = client
			.send_request(
				self.subject.clone(),
				async_nats::Request::new()
					.headers(message_headers)
					.payload(payload.into()),
			)
			.await
			.map_err(GatewayError::internal)?;

		let status = reply
			.headers
			.as_ref()
			.and_then(|h| h.get(HEADER_X_STATUS))
			.map(|v| v.as_str().to_string())
			.unwrap_or_default();
		if status == "200" {
			return Ok(Verdict::Continue(None));
		}
		let message = reply
			.headers
			.as_ref()
			.and_then(|h| h.get(HEADER_X_ERROR))
			.map(|v| v.as_str().to_string())
			.unwrap_or_else(|| "request denied by policy".to_string());
		Err(GatewayError::Filter {
			status: StatusCode::FORBIDDEN,
			message,
		})
	}
}
