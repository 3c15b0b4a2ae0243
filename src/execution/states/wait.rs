use std::time::Duration;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use super::{Route, StepOutcome};
use crate::error::StateError;
use crate::execution::engine::Runner;
use crate::execution::events::EventOutcome;
use crate::execution::scheduler::cancellable_sleep;
use crate::workflow::model::{DelayState, EventState};

/// Blocks until the event arrives, the timeout elapses or the run is
/// cancelled. The state's own timeout takes precedence over the engine
/// default; with neither the wait is unbounded.
pub(super) async fn event(
    runner: &Runner,
    state: &EventState,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StateError> {
    let timeout = state
        .timeout_ms
        .map(Duration::from_millis)
        .or_else(|| runner.runtime.config.event_timeout());

    debug!("Waiting for event '{}' (timeout {:?})", state.event, timeout);

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(StateError::Cancelled),
        outcome = runner.runtime.events.await_event(&state.event, timeout) => outcome?,
    };

    match outcome {
        EventOutcome::Received(payload) => {
            debug!("Event '{}' received", state.event);
            let data = match &state.event_data_filter {
                Some(filter) => runner.evaluator().evaluate(filter, &payload)?,
                None => payload,
            };
            Ok(StepOutcome::output(data))
        }
        EventOutcome::TimedOut => {
            let timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
            match &state.timeout_transition {
                Some(target) => {
                    warn!(
                        "No '{}' event within {} ms, moving to '{}'",
                        state.event, timeout_ms, target
                    );
                    Ok(StepOutcome {
                        output: None,
                        route: Route::To(target.clone()),
                    })
                }
                None => Err(StateError::EventTimeout {
                    event: state.event.clone(),
                    timeout_ms,
                }),
            }
        }
    }
}

pub(super) async fn delay(state: &DelayState, cancel: &CancellationToken) -> Result<StepOutcome, StateError> {
    debug!("Delaying for {} ms", state.delay_ms);
    cancellable_sleep(Duration::from_millis(state.delay_ms), cancel).await?;
    Ok(StepOutcome::silent())
}
