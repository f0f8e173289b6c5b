mod caller;

pub use caller::{Caller, DEFAULT_CALL_TIMEOUT, Level, Verdict, sort};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use crate::http::shadow::{ShadowRequest, ShadowResponse};
use crate::http::updaters::{RequestUpdater, update_request, update_response};
use crate::http::{HeaderValue, Response, x_headers};
use crate::proxy::GatewayError;

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;

/// A spawned parallel caller: a single-shot result channel plus the deadline
/// its awaiter must observe.
struct SpawnedTask {
	rx: oneshot::Receiver<Result<Option<Response>, GatewayError>>,
	deadline: Instant,
}

type TaskMap = HashMap<String, SpawnedTask>;

/// Runs the sorted caller sequence over one in-flight exchange.
///
/// Synchronous callers execute strictly in order; parallel callers are
/// spawned in order but complete whenever, and only an await from a later
/// caller imposes a completion edge. There is no barrier at the end:
/// unawaited parallels are fire-and-forget.
pub async fn cascade(
	input: &mut ShadowRequest,
	callers: &[Arc<dyn Caller>],
) -> Result<Option<ShadowResponse>, GatewayError> {
	if callers.is_empty() {
		return Ok(None);
	}
	if !input.headers().contains_key(x_headers::X_REQUEST_ID) {
		let id = request_id();
		input.headers_mut().insert(
			x_headers::X_REQUEST_ID,
			HeaderValue::from_str(&id).map_err(GatewayError::internal)?,
		);
	}
	let mut out: Option<ShadowResponse> = None;
	let mut tasks = TaskMap::new();
	let original = input.clone_shadow();

	for caller in callers {
		await_tasks(caller.as_ref(), &mut tasks, input, &mut out).await?;

		if caller.is_parallel() {
			spawn(caller.clone(), &mut tasks, input, &original);
			continue;
		}

		let verdict = invoke(caller.as_ref(), input, &original).await?;
		match verdict {
			Verdict::Term(Some(res)) => {
				let res = ShadowResponse::new(res)
					.await
					.map_err(GatewayError::internal)?;
				return Ok(Some(res));
			},
			Verdict::Term(None) => break,
			Verdict::Continue(None) => {},
			Verdict::Continue(Some(res)) => {
				let src = ShadowResponse::new(res)
					.await
					.map_err(GatewayError::internal)?;
				merge_response(&mut out, src, &caller.response_updaters());
				let derived = out
					.as_ref()
					.expect("merge always yields a response")
					.create_request();
				let mut updaters = caller.request_updaters();
				updaters.push(RequestUpdater::UpdateHeader(vec![x_headers::X_REQUEST_ID]));
				update_request(input, &derived, &updaters);
				input.reset();
			},
		}
	}
	if let Some(out) = out.as_mut() {
		out.reset();
	}
	Ok(out)
}

/// Joins every task named in the caller's await-list before it runs. The
/// join is bounded by both deadlines: the spawned task's and the awaiting
/// caller's own.
async fn await_tasks(
	caller: &dyn Caller,
	tasks: &mut TaskMap,
	input: &mut ShadowRequest,
	out: &mut Option<ShadowResponse>,
) -> Result<(), GatewayError> {
	if caller.await_list().is_empty() {
		return Ok(());
	}
	let waiter_deadline = Instant::now() + caller.timeout();
	for name in caller.await_list() {
		let mut task = tasks
			.remove(name)
			.ok_or_else(|| GatewayError::TaskNotFound(name.clone()))?;
		let deadline = task.deadline.min(waiter_deadline);
		let result = tokio::select! {
			received = &mut task.rx => {
				received.map_err(|_| GatewayError::Internal("task dropped its result".to_string()))?
			},
			_ = tokio::time::sleep_until(deadline) => Err(GatewayError::Timeout),
		};
		let Some(res) = result? else {
			continue;
		};
		let src = ShadowResponse::new(res)
			.await
			.map_err(GatewayError::internal)?;
		merge_response(out, src, &caller.response_updaters());
		let derived = out
			.as_ref()
			.expect("merge always yields a response")
			.create_request();
		update_request(input, &derived, &caller.request_updaters());
		input.reset();
	}
	Ok(())
}

/// Launches a parallel caller. The task sends exactly one result; failures
/// are logged here so an unawaited error is still observable.
fn spawn(caller: Arc<dyn Caller>, tasks: &mut TaskMap, input: &ShadowRequest, original: &ShadowRequest) {
	let (tx, rx) = oneshot::channel();
	let deadline = Instant::now() + caller.timeout();
	tasks.insert(caller.name().to_string(), SpawnedTask { rx, deadline });
	let current = input.clone_shadow();
	let original = original.clone_shadow();
	tokio::spawn(async move {
		let result = match invoke(caller.as_ref(), &current, &original).await {
			Ok(Verdict::Continue(res)) | Ok(Verdict::Term(res)) => Ok(res),
			Err(err) => Err(err),
		};
		if let Err(err) = &result {
			warn!(caller = caller.name(), "parallel caller failed: {err}");
		}
		let _ = tx.send(result);
	});
}

async fn invoke(
	caller: &dyn Caller,
	current: &ShadowRequest,
	original: &ShadowRequest,
) -> Result<Verdict, GatewayError> {
	tokio::time::timeout(
		caller.timeout(),
		caller.call(&original.route_values, current, original),
	)
	.await
	.map_err(|_| GatewayError::Timeout)?
}

/// First response becomes the accumulator wholesale; later ones are merged
/// through the caller's response updaters. A whole-header replacement also
/// carries the source's status: the status line belongs to the head, so a
/// caller that swaps the head (the outbound proxy does) swaps the status.
fn merge_response(
	out: &mut Option<ShadowResponse>,
	src: ShadowResponse,
	updaters: &[crate::http::updaters::ResponseUpdater],
) {
	match out {
		None => *out = Some(src),
		Some(acc) => {
			if updaters
				.iter()
				.any(|u| matches!(u, crate::http::updaters::ResponseUpdater::ReplaceHeader))
			{
				acc.set_status(src.status());
			}
			update_response(acc, &src, updaters);
			acc.reset();
		},
	}
}

fn request_id() -> String {
	format!("{:032x}", rand::random::<u128>())
}
