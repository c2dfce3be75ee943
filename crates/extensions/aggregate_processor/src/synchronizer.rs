use crate::AggregateAction;
use crate::AggregateActionOutput;
use crate::AggregateActionResponse;
use crate::AggregateGroup;
use crate::AggregateGroupManager;
use crate::IdentificationKeysMap;
use prepper_api::metrics::Counter;
use prepper_api::Event;
use prepper_api::PluginMetrics;
use std::any::Any;
use std::fmt::Display;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::debug;
use tracing::warn;

pub const ACTION_HANDLE_ERRORS: &str = "actionHandleErrors";
pub const ACTION_CONCLUDE_GROUP_ERRORS: &str = "actionConcludeGroupErrors";

/// Calls the aggregate action under the group locks
///
/// - Events are handled one at a time per group, holding the handle lock.
/// - A group is concluded by a single thread at a time, the one that gets the conclude lock.
///   The other threads trying to conclude the same group give up.
/// - Before handling an event, a thread waits for any in-flight conclusion of the group,
///   by acquiring the conclude lock and releasing it immediately.
///   Holding it the whole time would prevent concurrent events from being handled
///   one after the other while a conclusion is pending.
///
/// Action failures, errors or panics, are contained:
/// a failed handling emits the original event and a failed conclusion emits nothing.
pub struct AggregateActionSynchronizer {
    action: Arc<dyn AggregateAction>,
    group_manager: Arc<AggregateGroupManager>,
    action_handle_errors: Arc<Counter>,
    action_conclude_group_errors: Arc<Counter>,
}

impl AggregateActionSynchronizer {
    pub fn new(
        action: Arc<dyn AggregateAction>,
        group_manager: Arc<AggregateGroupManager>,
        metrics: &PluginMetrics,
    ) -> Self {
        AggregateActionSynchronizer {
            action,
            group_manager,
            action_handle_errors: metrics.counter(ACTION_HANDLE_ERRORS),
            action_conclude_group_errors: metrics.counter(ACTION_CONCLUDE_GROUP_ERRORS),
        }
    }

    pub fn handle_event_for_group(
        &self,
        event: &Event,
        key: &IdentificationKeysMap,
        group: &Arc<AggregateGroup>,
    ) -> AggregateActionResponse {
        drop(group.lock_conclude());
        let mut input = group.lock_handle();

        match catch_unwind(AssertUnwindSafe(|| {
            self.action.handle_event(event, &mut input)
        })) {
            Ok(Ok(response)) => {
                self.group_manager.put_group_with_hash(key, group);
                response
            }
            Ok(Err(err)) => {
                warn!(target: "aggregate", "Error while handling an event for group {key}: {err}");
                self.action_handle_errors.increment();
                AggregateActionResponse::from_event(event.clone())
            }
            Err(panic) => {
                warn!(target: "aggregate", "Panic while handling an event for group {key}: {}", PanicMessage(&*panic));
                self.action_handle_errors.increment();
                AggregateActionResponse::from_event(event.clone())
            }
        }
    }

    pub fn conclude_group(
        &self,
        key: &IdentificationKeysMap,
        group: &Arc<AggregateGroup>,
        force: bool,
    ) -> AggregateActionOutput {
        let Some(_conclude_guard) = group.try_lock_conclude() else {
            return AggregateActionOutput::default();
        };
        let mut input = group.lock_handle();
        if !force && !self.group_manager.should_conclude_group(&input) {
            return AggregateActionOutput::default();
        }

        debug!(target: "aggregate", "Concluding group {key}");
        let output = match catch_unwind(AssertUnwindSafe(|| {
            self.action.conclude_group(&mut input)
        })) {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(target: "aggregate", "Error while concluding group {key}: {err}");
                self.action_conclude_group_errors.increment();
                AggregateActionOutput::default()
            }
            Err(panic) => {
                warn!(target: "aggregate", "Panic while concluding group {key}: {}", PanicMessage(&*panic));
                self.action_conclude_group_errors.increment();
                AggregateActionOutput::default()
            }
        };

        self.group_manager.close_group(&mut input);
        if force {
            self.group_manager.retire_group(key, group);
        }
        output
    }
}

struct PanicMessage<'a>(&'a (dyn Any + Send));

impl Display for PanicMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(message) = self.0.downcast_ref::<&str>() {
            write!(f, "{message}")
        } else if let Some(message) = self.0.downcast_ref::<String>() {
            write!(f, "{message}")
        } else {
            write!(f, "unknown panic payload")
        }
    }
}
