use crate::actions::parse_settings;
use crate::actions::BuiltinAction;
use crate::actions::NoSettings;
use crate::config::ConfigError;
use crate::ActionError;
use crate::AggregateAction;
use crate::AggregateActionInput;
use crate::AggregateActionOutput;
use crate::AggregateActionResponse;
use prepper_api::Event;
use prepper_api::ExpressionEvaluator;
use serde_json::Value;
use std::sync::Arc;

/// Combines all the events of a window into a single event
///
/// When several events have the same field, the last value wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct PutAllAggregateAction;

impl BuiltinAction for PutAllAggregateAction {
    fn name(&self) -> &str {
        "put_all"
    }

    fn set_config(
        &mut self,
        settings: Value,
        _evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<(), ConfigError> {
        let NoSettings {} = parse_settings(self.name(), settings)?;
        Ok(())
    }
}

impl AggregateAction for PutAllAggregateAction {
    fn handle_event(
        &self,
        event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError> {
        input.group_state_mut().extend(event.to_map().clone());
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
