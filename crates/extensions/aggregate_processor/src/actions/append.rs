use crate::actions::parse_settings;
use crate::actions::BuiltinAction;
use crate::config::ConfigError;
use crate::ActionError;
use crate::AggregateAction;
use crate::AggregateActionInput;
use crate::AggregateActionOutput;
use crate::AggregateActionResponse;
use crate::GroupState;
use prepper_api::Event;
use prepper_api::ExpressionEvaluator;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Combines the events of a window, collecting the distinct values of a field into a list
///
/// The first event of the window is taken as is. For each following event:
/// - a value appended to a field already holding a list is pushed to that list,
///   or concatenated if the value is itself a list,
/// - a value different from the scalar value of a field turns that field into a list of both values,
/// - a value equal to the value of the field is ignored,
/// - a field not seen so far is added as is.
///
/// Only the `keys_to_append` fields are considered, all of them if none is given.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppendAggregateAction {
    #[serde(default)]
    keys_to_append: Vec<String>,
}

impl BuiltinAction for AppendAggregateAction {
    fn name(&self) -> &str {
        "append"
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

impl AppendAggregateAction {
    fn is_appended(&self, key: &str) -> bool {
        self.keys_to_append.is_empty() || self.keys_to_append.iter().any(|k| k == key)
    }

    fn append(state: &mut GroupState, key: &str, value: &Value) {
        match state.get_mut(key) {
            None => {
                state.insert(key, value.clone());
            }
            Some(Value::Array(values)) => match value {
                Value::Array(more) => values.extend(more.iter().cloned()),
                value => values.push(value.clone()),
            },
            Some(current) if *current == *value => {}
            Some(current) => {
                let previous = current.take();
                *current = Value::Array(vec![previous, value.clone()]);
            }
        }
    }
}

impl AggregateAction for AppendAggregateAction {
    fn handle_event(
        &self,
        event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError> {
        let state = input.group_state_mut();
        if state.is_empty() {
            state.extend(event.to_map().clone());
        } else {
            for (key, value) in event.to_map() {
                if self.is_appended(key) {
                    Self::append(state, key, value);
                }
            }
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
