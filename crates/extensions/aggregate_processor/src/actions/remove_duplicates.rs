use crate::actions::parse_settings;
use crate::actions::BuiltinAction;
use crate::actions::NoSettings;
use crate::config::ConfigError;
use crate::ActionError;
use crate::AggregateAction;
use crate::AggregateActionInput;
use crate::AggregateActionResponse;
use prepper_api::Event;
use prepper_api::ExpressionEvaluator;
use serde_json::Value;
use std::sync::Arc;

/// Emits the first event of each window, dropping the others
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoveDuplicatesAggregateAction;

impl BuiltinAction for RemoveDuplicatesAggregateAction {
    fn name(&self) -> &str {
        "remove_duplicates"
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

impl AggregateAction for RemoveDuplicatesAggregateAction {
    fn handle_event(
        &self,
        event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError> {
        if !input.group_state().is_empty() {
            return Ok(AggregateActionResponse::null_event_response());
        }

        let keys = input.identification_keys().to_map();
        input.group_state_mut().extend(keys);
        Ok(AggregateActionResponse::from_event(event.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentificationKeysMap;
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn only_the_first_event_of_a_window_is_emitted() {
        let action = RemoveDuplicatesAggregateAction;
        let keys: IdentificationKeysMap = [("id", json!(1))].into_iter().collect();
        let mut input = AggregateActionInput::new(keys, Instant::now());
        let first = Event::try_from(json!({"id": 1, "n": 1})).unwrap();
        let second = Event::try_from(json!({"id": 1, "n": 2})).unwrap();

        let response = action.handle_event(&first, &mut input).unwrap();
        assert_eq!(response.into_event(), Some(first.clone()));

        let response = action.handle_event(&second, &mut input).unwrap();
        assert_eq!(response.into_event(), None);

        assert!(action.conclude_group(&mut input).unwrap().is_empty());

        input.reset_group(Instant::now());
        let response = action.handle_event(&second, &mut input).unwrap();
        assert_eq!(response.into_event(), Some(second));
    }
}
