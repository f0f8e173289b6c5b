use std::ops::BitOr;
use std::time::Duration;

use async_trait::async_trait;

use crate::http::Response;
use crate::http::shadow::ShadowRequest;
use crate::http::updaters::{RequestUpdater, ResponseUpdater};
use crate::proxy::GatewayError;
use crate::router::RouteValues;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Execution phase bucket. A caller's level is a bitmask; a caller carrying
/// several bits is placed into every matching bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Level(u8);

impl Level {
	pub const NONE: Level = Level(1);
	pub const CONNECT: Level = Level(2);
	pub const PRE: Level = Level(4);
	pub const REQUEST: Level = Level(8);
	pub const RESPONSE: Level = Level(16);
	pub const POST: Level = Level(32);

	pub fn contains(self, other: Level) -> bool {
		self.0 & other.0 == other.0
	}
}

impl BitOr for Level {
	type Output = Level;

	fn bitor(self, rhs: Level) -> Level {
		Level(self.0 | rhs.0)
	}
}

/// The outcome of one caller invocation.
///
/// `Term` stops the cascade: a carried response is returned to the client
/// verbatim, otherwise the accumulated response is. `Continue` merges any
/// carried response through the caller's updaters and moves on; with no
/// response it is a no-op.
#[derive(Debug)]
pub enum Verdict {
	Continue(Option<Response>),
	Term(Option<Response>),
}

/// A named pipeline step. Parallel callers are spawned in sorted order and
/// joined only by an explicit await from a later caller's await-list.
#[async_trait]
pub trait Caller: Send + Sync {
	fn level(&self) -> Level;

	fn is_parallel(&self) -> bool {
		false
	}

	/// Unique within a cascade when the caller is parallel.
	fn name(&self) -> &str {
		""
	}

	fn await_list(&self) -> &[String] {
		&[]
	}

	/// Deadline applied freshly at each invocation.
	fn timeout(&self) -> Duration {
		DEFAULT_CALL_TIMEOUT
	}

	fn request_updaters(&self) -> Vec<RequestUpdater> {
		Vec::new()
	}

	fn response_updaters(&self) -> Vec<ResponseUpdater> {
		Vec::new()
	}

	async fn call(
		&self,
		rv: &RouteValues,
		current: &ShadowRequest,
		original: &ShadowRequest,
	) -> Result<Verdict, GatewayError>;
}

/// Partitions callers into level buckets and concatenates them in execution
/// order: connect, pre, request, main, response, post. Relative input order
/// is preserved within each bucket.
pub fn sort(callers: Vec<std::sync::Arc<dyn Caller>>) -> Vec<std::sync::Arc<dyn Caller>> {
	let mut connect = Vec::new();
	let mut pre = Vec::new();
	let mut request = Vec::new();
	let mut main = Vec::new();
	let mut response = Vec::new();
	let mut post = Vec::new();
	for caller in callers {
		let level = caller.level();
		if level == Level::PRE {
			pre.push(caller);
			continue;
		}
		if level == Level::POST {
			post.push(caller);
			continue;
		}
		if level.contains(Level::CONNECT) {
			connect.push(caller.clone());
		}
		if level.contains(Level::REQUEST) {
			request.push(caller.clone());
		}
		if level.contains(Level::NONE) {
			main.push(caller.clone());
		}
		if level.contains(Level::RESPONSE) {
			response.push(caller.clone());
		}
	}
	let mut sorted = connect;
	sorted.append(&mut pre);
	sorted.append(&mut request);
	sorted.append(&mut main);
	sorted.append(&mut response);
	sorted.append(&mut post);
	sorted
}
