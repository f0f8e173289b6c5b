use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::proxy::Handler;

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;

/// Placeholder bindings produced by a route match: placeholder name → the
/// matching segment of the concrete URL.
pub type RouteValues = HashMap<String, String>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
	#[error("no match found")]
	NoMatchFound,
	#[error("no url registered")]
	NoUrlRegistered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
	Literal(String),
	Param(String),
}

/// An ordered sequence of path segments; literals score 2 and placeholders 1
/// towards a candidate's specificity rank.
#[derive(Debug, Clone)]
pub struct Route {
	segments: Vec<Segment>,
	method: String,
}

impl Route {
	pub fn parse(path: &str, method: &str) -> Route {
		let segments = path
			.split('/')
			.filter(|s| !s.is_empty())
			.map(|s| match s.strip_prefix(':') {
				Some(name) => Segment::Param(name.to_string()),
				None => Segment::Literal(s.to_string()),
			})
			.collect();
		Route {
			segments,
			method: method.to_ascii_uppercase(),
		}
	}

	pub fn len(&self) -> usize {
		self.segments.len()
	}

	pub fn is_empty(&self) -> bool {
		self.segments.is_empty()
	}

	/// Specificity rank against concrete segments, or `None` when the route
	/// does not match. Segment counts must already agree.
	fn rank(&self, concrete: &[&str]) -> Option<usize> {
		if self.segments.len() != concrete.len() {
			return None;
		}
		let mut rank = 0;
		for (segment, value) in self.segments.iter().zip(concrete) {
			match segment {
				Segment::Param(_) => rank += 1,
				Segment::Literal(lit) if lit == value => rank += 2,
				Segment::Literal(_) => return None,
			}
		}
		Some(rank)
	}

	fn bind(&self, concrete: &[&str]) -> RouteValues {
		let mut values = RouteValues::new();
		for (segment, value) in self.segments.iter().zip(concrete) {
			if let Segment::Param(name) = segment {
				values.insert(name.clone(), value.to_string());
			}
		}
		values
	}
}

/// Registration dedup key: SHA-256 over `METHOD:path`.
fn route_hash(path: &str, method: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(method.to_ascii_uppercase().as_bytes());
	hasher.update(b":");
	hasher.update(path.as_bytes());
	hex::encode(hasher.finalize())
}

struct RegisteredRoute {
	route: Route,
	hash: String,
}

#[derive(Default)]
struct TableInner {
	routes: HashMap<usize, Vec<RegisteredRoute>>,
	handlers: HashMap<String, Arc<dyn Handler>>,
}

/// Mapping from segment count to same-length routes. Registrations and
/// lookups may run concurrently; the lock is held only across map access.
#[derive(Default)]
pub struct RouteTable {
	inner: RwLock<TableInner>,
}

static DEFAULT_ROUTE_TABLE: Lazy<RouteTable> = Lazy::new(RouteTable::default);

pub fn default_route_table() -> &'static RouteTable {
	&DEFAULT_ROUTE_TABLE
}

impl RouteTable {
	pub fn new() -> RouteTable {
		RouteTable::default()
	}

	/// Registers a handler for `(path, method)`. A second registration of the
	/// same pair is ignored.
	pub fn register(&self, path: &str, method: &str, handler: Arc<dyn Handler>) {
		let route = Route::parse(path, method);
		let hash = route_hash(path, method);
		let mut inner = self.inner.write();
		if inner.handlers.contains_key(&hash) {
			return;
		}
		inner.handlers.insert(hash.clone(), handler);
		inner
			.routes
			.entry(route.len())
			.or_default()
			.push(RegisteredRoute { route, hash });
	}

	/// Resolves a concrete URL path: all same-length entries with a matching
	/// method are ranked and the maximum wins; ties go to the first
	/// registered. A fully-literal route always outranks a placeholder one.
	pub fn find(&self, path: &str, method: &str) -> Result<(Arc<dyn Handler>, RouteValues), RouterError> {
		let inner = self.inner.read();
		if inner.routes.is_empty() {
			return Err(RouterError::NoUrlRegistered);
		}
		let concrete: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
		let candidates = inner
			.routes
			.get(&concrete.len())
			.ok_or(RouterError::NoMatchFound)?;
		let method = method.to_ascii_uppercase();
		let mut best: Option<(usize, &RegisteredRoute)> = None;
		for candidate in candidates {
			if candidate.route.method != method {
				continue;
			}
			let Some(rank) = candidate.route.rank(&concrete) else {
				continue;
			};
			if best.as_ref().is_none_or(|(top, _)| rank > *top) {
				best = Some((rank, candidate));
			}
		}
		let (_, found) = best.ok_or(RouterError::NoMatchFound)?;
		let handler = inner.handlers[&found.hash].clone();
		Ok((handler, found.route.bind(&concrete)))
	}
}
