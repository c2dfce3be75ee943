use crate::actions::parse_settings;
use crate::actions::BuiltinAction;
use crate::config::ConfigError;
use crate::ActionError;
use crate::AggregateAction;
use crate::AggregateActionInput;
use crate::AggregateActionOutput;
use crate::AggregateActionResponse;
use prepper_api::Event;
use prepper_api::ExpressionEvaluator;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DEFAULT_COUNT_KEY: &str = "aggr._count";

/// Counts the events of each window
///
/// The concluded event is made of the identification keys plus the count,
/// and optionally the time the first event of the window was received.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CountAggregateAction {
    #[serde(default = "default_count_key")]
    count_key: String,

    #[serde(default)]
    start_time_key: Option<String>,
}

fn default_count_key() -> String {
    DEFAULT_COUNT_KEY.to_string()
}

impl Default for CountAggregateAction {
    fn default() -> Self {
        CountAggregateAction {
            count_key: default_count_key(),
            start_time_key: None,
        }
    }
}

impl BuiltinAction for CountAggregateAction {
    fn name(&self) -> &str {
        "count"
    }

    fn set_config(
        &mut self,
        settings: Value,
        _evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<(), ConfigError> {
        *self = parse_settings(self.name(), settings)?;
        Ok(())
    }
}

impl AggregateAction for CountAggregateAction {
    fn handle_event(
        &self,
        _event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError> {
        if input.group_state().is_empty() {
            let mut state = input.identification_keys().to_map();
            state.insert(self.count_key.clone(), Value::from(1u64));
            if let Some(start_time_key) = &self.start_time_key {
                let start_time = OffsetDateTime::now_utc()
                    .format(&Rfc3339)
                    .map_err(|err| ActionError::Failed(err.to_string()))?;
                state.insert(start_time_key.clone(), Value::from(start_time));
            }
            input.group_state_mut().extend(state);
        } else {
            let count = input
                .group_state()
                .get(&self.count_key)
                .and_then(Value::as_u64)
                .unwrap_or_default();
            input.group_state_mut().insert(self.count_key.clone(), count + 1);
        }
        Ok(AggregateActionResponse::null_event_response())
    }

    fn conclude_group(
        &self,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionOutput, ActionError> {
        let state = input.group_state();
        if state.is_empty() {
            return Ok(AggregateActionOutput::default());
        }
        Ok(state.to_event().into())
    }
}
