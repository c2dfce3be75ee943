use crate::actions::BuiltinActions;
use crate::config::AggregateProcessorConfig;
use crate::config::ConfigError;
use crate::AggregateAction;
use crate::AggregateActionSynchronizer;
use crate::AggregateGroupManager;
use crate::IdentificationKeysHasher;
use clock::Clock;
use clock::WallClock;
use prepper_api::metrics::Counter;
use prepper_api::metrics::Timer;
use prepper_api::metrics::RECORDS_IN;
use prepper_api::metrics::RECORDS_OUT;
use prepper_api::metrics::TIME_ELAPSED;
use prepper_api::Event;
use prepper_api::ExpressionEvaluator;
use prepper_api::PluginMetrics;
use prepper_api::Processor;
use prepper_api::Record;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;
use tracing::warn;

pub const ACTION_HANDLE_EVENTS_OUT: &str = "actionHandleEventsOut";
pub const ACTION_HANDLE_EVENTS_DROPPED: &str = "actionHandleEventsDropped";
pub const ACTION_CONCLUDE_GROUP_EVENTS_OUT: &str = "actionConcludeGroupEventsOut";
pub const ACTION_CONCLUDE_GROUP_EVENTS_DROPPED: &str = "actionConcludeGroupEventsDropped";

/// Groups events by identification keys and applies an aggregate action to each group
///
/// A single processor is shared by all the pipeline workers, each calling `execute` on its own batches.
pub struct AggregateProcessor {
    hasher: IdentificationKeysHasher,
    group_manager: Arc<AggregateGroupManager>,
    synchronizer: AggregateActionSynchronizer,
    evaluator: Arc<dyn ExpressionEvaluator>,
    aggregate_when: Option<String>,
    aggregated_events_tag: Option<String>,
    force_conclude: AtomicBool,
    metrics: PluginMetrics,
    records_in: Arc<Counter>,
    records_out: Arc<Counter>,
    action_handle_events_out: Arc<Counter>,
    action_handle_events_dropped: Arc<Counter>,
    action_conclude_group_events_out: Arc<Counter>,
    action_conclude_group_events_dropped: Arc<Counter>,
    time_elapsed: Arc<Timer>,
}

impl AggregateProcessor {
    /// Create a processor applying the builtin action named by the config
    pub fn try_new(
        config: &AggregateProcessorConfig,
        actions: &BuiltinActions,
        evaluator: Arc<dyn ExpressionEvaluator>,
        metrics: PluginMetrics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let action =
            actions.new_instance(&config.action.name, config.action.settings.clone(), &evaluator)?;
        Self::with_action(config, action, evaluator, metrics, Arc::new(WallClock))
    }

    /// Create a processor applying a given action
    pub fn with_action(
        config: &AggregateProcessorConfig,
        action: Arc<dyn AggregateAction>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        metrics: PluginMetrics,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let group_manager = Arc::new(AggregateGroupManager::new(config.group_duration, clock));
        let synchronizer = AggregateActionSynchronizer::new(action, group_manager.clone(), &metrics);
        Ok(AggregateProcessor {
            hasher: IdentificationKeysHasher::new(config.identification_keys.clone()),
            group_manager,
            synchronizer,
            evaluator,
            aggregate_when: config.aggregate_when.clone(),
            aggregated_events_tag: config.aggregated_events_tag.clone(),
            force_conclude: AtomicBool::new(false),
            records_in: metrics.counter(RECORDS_IN),
            records_out: metrics.counter(RECORDS_OUT),
            action_handle_events_out: metrics.counter(ACTION_HANDLE_EVENTS_OUT),
            action_handle_events_dropped: metrics.counter(ACTION_HANDLE_EVENTS_DROPPED),
            action_conclude_group_events_out: metrics.counter(ACTION_CONCLUDE_GROUP_EVENTS_OUT),
            action_conclude_group_events_dropped: metrics
                .counter(ACTION_CONCLUDE_GROUP_EVENTS_DROPPED),
            time_elapsed: metrics.timer(TIME_ELAPSED),
            metrics,
        })
    }

    pub fn metrics(&self) -> &PluginMetrics {
        &self.metrics
    }

    pub fn group_manager(&self) -> &AggregateGroupManager {
        &self.group_manager
    }

    fn do_execute(&self, records: Vec<Record<Event>>) -> Vec<Record<Event>> {
        let mut records_out = Vec::new();
        let mut handle_events_out = 0;
        let mut handle_events_dropped = 0;

        for record in records {
            let event = record.into_data();
            if !self.should_aggregate(&event) {
                records_out.push(Record::new(event));
                continue;
            }

            let key = self
                .hasher
                .create_identification_keys_map_from_event(&event);
            let group = self.group_manager.get_or_create_group(&key);
            let response = self
                .synchronizer
                .handle_event_for_group(&event, &key, &group);
            match response.into_event() {
                Some(event) => {
                    records_out.push(Record::new(self.tagged(event)));
                    handle_events_out += 1;
                }
                None => handle_events_dropped += 1,
            }
        }
        self.action_handle_events_out.increment_by(handle_events_out);
        self.action_handle_events_dropped
            .increment_by(handle_events_dropped);

        let force = self.force_conclude.load(Ordering::Acquire);
        for (key, group) in self.group_manager.get_groups_to_conclude(force) {
            let output = self.synchronizer.conclude_group(&key, &group, force);
            if output.is_empty() {
                self.action_conclude_group_events_dropped.increment();
                continue;
            }
            self.action_conclude_group_events_out
                .increment_by(output.len() as u64);
            records_out.extend(
                output
                    .into_events()
                    .into_iter()
                    .map(|event| Record::new(self.tagged(event))),
            );
        }

        records_out
    }

    /// Events not matching the `aggregate_when` condition pass through untouched
    fn should_aggregate(&self, event: &Event) -> bool {
        let Some(condition) = &self.aggregate_when else {
            return true;
        };
        match self.evaluator.evaluate(condition, event) {
            Ok(matched) => matched,
            Err(err) => {
                warn!(target: "aggregate", "Failed to evaluate {condition:?}, the event is not aggregated: {err}");
                false
            }
        }
    }

    fn tagged(&self, mut event: Event) -> Event {
        if let Some(tag) = &self.aggregated_events_tag {
            event.add_tags([tag.as_str()]);
        }
        event
    }
}

impl Processor for AggregateProcessor {
    fn execute(&self, records: Vec<Record<Event>>) -> Vec<Record<Event>> {
        self.records_in.increment_by(records.len() as u64);
        let records_out = self.time_elapsed.time(|| self.do_execute(records));
        self.records_out.increment_by(records_out.len() as u64);
        records_out
    }

    fn prepare_for_shutdown(&self) {
        info!(target: "aggregate", "Concluding all the groups before shutdown");
        self.force_conclude.store(true, Ordering::Release);
    }

    fn is_ready_for_shutdown(&self) -> bool {
        self.group_manager.get_all_groups_size() == 0
    }

    fn shutdown(&self) {
        self.metrics.dump_processing_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::MockAggregateAction;
    use crate::synchronizer::ACTION_HANDLE_ERRORS;
    use crate::ActionError;
    use crate::AggregateActionInput;
    use crate::AggregateActionOutput;
    use crate::AggregateActionResponse;
    use assert_matches::assert_matches;
    use clock::ManualClock;
    use pretty_assertions::assert_eq;
    use prepper_api::ExpressionError;
    use prepper_api::SimpleExpressionEvaluator;
    use serde_json::json;
    use serde_json::Value;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    fn records(values: Vec<Value>) -> Vec<Record<Event>> {
        values
            .into_iter()
            .map(|value| Record::new(Event::try_from(value).unwrap()))
            .collect()
    }

    fn payloads(records: &[Record<Event>]) -> Vec<Value> {
        records.iter().map(|record| record.data().to_json()).collect()
    }

    fn config(group_duration: Duration) -> AggregateProcessorConfig {
        AggregateProcessorConfig::new(vec!["id".to_string()], group_duration, "test")
    }

    fn processor(config: &AggregateProcessorConfig, action: impl AggregateAction) -> AggregateProcessor {
        AggregateProcessor::with_action(
            config,
            Arc::new(action),
            Arc::new(SimpleExpressionEvaluator::new()),
            PluginMetrics::new("aggregate"),
            Arc::new(WallClock),
        )
        .unwrap()
    }

    fn count(processor: &AggregateProcessor, name: &str) -> u64 {
        processor.metrics().counter(name).count()
    }

    #[test]
    fn emitted_and_dropped_events_are_counted() {
        let mut action = MockAggregateAction::new();
        action.expect_handle_event().returning(|event, _| {
            if event.get("keep") == Some(&json!(true)) {
                Ok(AggregateActionResponse::from_event(event.clone()))
            } else {
                Ok(AggregateActionResponse::null_event_response())
            }
        });
        action.expect_conclude_group().never();
        let processor = processor(&config(Duration::from_secs(60)), action);

        let output = processor.execute(records(vec![
            json!({"id": 1, "keep": true}),
            json!({"id": 1, "keep": false}),
            json!({"id": 2, "keep": false}),
        ]));

        assert_eq!(payloads(&output), vec![json!({"id": 1, "keep": true})]);
        assert_eq!(count(&processor, RECORDS_IN), 3);
        assert_eq!(count(&processor, RECORDS_OUT), 1);
        assert_eq!(count(&processor, ACTION_HANDLE_EVENTS_OUT), 1);
        assert_eq!(count(&processor, ACTION_HANDLE_EVENTS_DROPPED), 2);
        assert_eq!(processor.group_manager().get_all_groups_size(), 2);
    }

    #[test]
    fn failing_actions_let_the_events_through() {
        let mut action = MockAggregateAction::new();
        action
            .expect_handle_event()
            .returning(|_, _| Err(ActionError::Failed("boom".to_string())));
        let processor = processor(&config(Duration::from_secs(60)), action);

        let output = processor.execute(records(vec![json!({"id": 1})]));

        assert_eq!(payloads(&output), vec![json!({"id": 1})]);
        assert_eq!(count(&processor, ACTION_HANDLE_ERRORS), 1);
        assert_eq!(count(&processor, ACTION_HANDLE_EVENTS_OUT), 1);
    }

    #[test]
    fn concluded_groups_are_emitted_and_counted() {
        let mut action = MockAggregateAction::new();
        action
            .expect_handle_event()
            .returning(|_, _| Ok(AggregateActionResponse::null_event_response()));
        action.expect_conclude_group().returning(|input| {
            let id = input.identification_keys().get("id").cloned().unwrap_or_default();
            if id == json!(1) {
                Ok(Event::try_from(json!({"id": 1, "concluded": true})).unwrap().into())
            } else {
                Ok(AggregateActionOutput::default())
            }
        });
        let processor = processor(&config(Duration::from_nanos(1)), action);

        processor.execute(records(vec![json!({"id": 1}), json!({"id": 2})]));
        std::thread::sleep(Duration::from_millis(5));
        let output = processor.execute(vec![]);

        assert_eq!(payloads(&output), vec![json!({"id": 1, "concluded": true})]);
        assert!(count(&processor, ACTION_CONCLUDE_GROUP_EVENTS_OUT) >= 1);
        assert!(count(&processor, ACTION_CONCLUDE_GROUP_EVENTS_DROPPED) >= 1);
    }

    #[test]
    fn shutdown_forces_the_conclusion_of_all_groups() {
        let mut action = MockAggregateAction::new();
        action
            .expect_handle_event()
            .returning(|_, _| Ok(AggregateActionResponse::null_event_response()));
        action
            .expect_conclude_group()
            .times(2)
            .returning(|input| Ok(input.identification_keys().to_event().into()));
        let processor = processor(&config(Duration::from_secs(3600)), action);

        processor.execute(records(vec![json!({"id": 1}), json!({"id": 2})]));
        assert!(processor.execute(vec![]).is_empty());
        assert!(!processor.is_ready_for_shutdown());

        processor.prepare_for_shutdown();
        let output = processor.execute(vec![]);

        let mut concluded = payloads(&output);
        concluded.sort_by_key(|value| value["id"].as_i64());
        assert_eq!(concluded, vec![json!({"id": 1}), json!({"id": 2})]);
        assert!(processor.is_ready_for_shutdown());
    }

    #[test]
    fn events_not_matching_the_condition_pass_through() {
        let mut action = MockAggregateAction::new();
        action
            .expect_handle_event()
            .times(1)
            .returning(|_, _| Ok(AggregateActionResponse::null_event_response()));
        let mut config = config(Duration::from_secs(60));
        config.aggregate_when = Some("/status == 200".to_string());
        let processor = processor(&config, action);

        let output = processor.execute(records(vec![
            json!({"id": 1, "status": 200}),
            json!({"id": 1, "status": 500}),
        ]));

        assert_eq!(payloads(&output), vec![json!({"id": 1, "status": 500})]);
    }

    #[test]
    fn events_failing_the_condition_evaluation_pass_through() {
        struct FailingEvaluator;
        impl ExpressionEvaluator for FailingEvaluator {
            fn evaluate(&self, expression: &str, _event: &Event) -> Result<bool, ExpressionError> {
                Err(ExpressionError::InvalidExpression {
                    expression: expression.to_string(),
                    reason: "unsupported".to_string(),
                })
            }
        }

        let mut action = MockAggregateAction::new();
        action.expect_handle_event().never();
        let mut config = config(Duration::from_secs(60));
        config.aggregate_when = Some("whatever".to_string());
        let processor = AggregateProcessor::with_action(
            &config,
            Arc::new(action),
            Arc::new(FailingEvaluator),
            PluginMetrics::new("aggregate"),
            Arc::new(WallClock),
        )
        .unwrap();

        let output = processor.execute(records(vec![json!({"id": 1})]));
        assert_eq!(payloads(&output), vec![json!({"id": 1})]);
    }

    #[test]
    fn aggregated_events_are_tagged() {
        let mut action = MockAggregateAction::new();
        action
            .expect_handle_event()
            .returning(|event, _| Ok(AggregateActionResponse::from_event(event.clone())));
        let mut config = config(Duration::from_secs(60));
        config.aggregate_when = Some("/id == 1".to_string());
        config.aggregated_events_tag = Some("aggregated".to_string());
        let processor = processor(&config, action);

        let output = processor.execute(records(vec![json!({"id": 1}), json!({"id": 2})]));

        assert!(output[0].data().has_tag("aggregated"));
        assert!(!output[1].data().has_tag("aggregated"));
    }

    #[test]
    fn builtin_actions_are_selected_by_name() {
        let config = AggregateProcessorConfig::from_toml(
            r#"
identification_keys = ["id"]
action = { name = "count", settings = { count_key = "n" } }
"#,
        )
        .unwrap();
        let processor = AggregateProcessor::try_new(
            &config,
            &BuiltinActions::new(),
            Arc::new(SimpleExpressionEvaluator::new()),
            PluginMetrics::new("aggregate"),
        )
        .unwrap();

        processor.execute(records(vec![json!({"id": 1}), json!({"id": 1, "x": 2})]));
        processor.prepare_for_shutdown();
        let output = processor.execute(vec![]);

        assert_eq!(payloads(&output), vec![json!({"id": 1, "n": 2})]);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let config = AggregateProcessorConfig::new(vec![], Duration::from_secs(1), "count");
        assert_matches!(
            AggregateProcessor::try_new(
                &config,
                &BuiltinActions::new(),
                Arc::new(SimpleExpressionEvaluator::new()),
                PluginMetrics::new("aggregate"),
            )
            .err(),
            Some(ConfigError::NoIdentificationKeys)
        );
    }

    /// Blocks in `handle_event` on the events of group `id = 1`, till released
    struct BlockingAction {
        entered: Mutex<mpsc::Sender<()>>,
        released: Mutex<mpsc::Receiver<()>>,
    }

    impl AggregateAction for BlockingAction {
        fn handle_event(
            &self,
            event: &Event,
            _input: &mut AggregateActionInput,
        ) -> Result<AggregateActionResponse, ActionError> {
            if event.get("id") == Some(&json!(1)) {
                let _ = self.entered.lock().unwrap().send(());
                let _ = self.released.lock().unwrap().recv();
            }
            Ok(AggregateActionResponse::null_event_response())
        }

        fn conclude_group(
            &self,
            input: &mut AggregateActionInput,
        ) -> Result<AggregateActionOutput, ActionError> {
            Ok(input.identification_keys().to_event().into())
        }
    }

    #[test]
    fn a_busy_group_does_not_delay_the_conclusion_of_other_groups() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let action = BlockingAction {
            entered: Mutex::new(entered_tx),
            released: Mutex::new(release_rx),
        };
        let clock = ManualClock::default();
        let window = Duration::from_secs(10);
        let processor = Arc::new(
            AggregateProcessor::with_action(
                &config(window),
                Arc::new(action),
                Arc::new(SimpleExpressionEvaluator::new()),
                PluginMetrics::new("aggregate"),
                Arc::new(clock.clone()),
            )
            .unwrap(),
        );

        processor.execute(records(vec![json!({"id": 2})]));
        clock.advance(window);

        let busy = processor.clone();
        let busy_worker = std::thread::spawn(move || busy.execute(records(vec![json!({"id": 1})])));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let idle = processor.clone();
        std::thread::spawn(move || done_tx.send(idle.execute(vec![])));
        let output = done_rx.recv_timeout(Duration::from_secs(5));

        release_tx.send(()).unwrap();
        busy_worker.join().unwrap();
        assert_eq!(payloads(&output.unwrap()), vec![json!({"id": 2})]);
    }
}
