use crate::actions::parse_settings;
use crate::actions::BuiltinAction;
use crate::config::ConfigError;
use crate::ActionError;
use crate::AggregateAction;
use crate::AggregateActionInput;
use crate::AggregateActionResponse;
use prepper_api::Event;
use prepper_api::ExpressionEvaluator;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Lets through a given percentage of the events of each group
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PercentSamplerAggregateAction {
    percent: f64,
}

#[derive(Default)]
struct SampledEvents {
    allowed: u64,
    total: u64,
}

impl Default for PercentSamplerAggregateAction {
    fn default() -> Self {
        PercentSamplerAggregateAction { percent: 100.0 }
    }
}

impl PercentSamplerAggregateAction {
    pub fn try_new(percent: f64) -> Result<Self, ConfigError> {
        if !(percent > 0.0 && percent <= 100.0) {
            return Err(ConfigError::InvalidSettings {
                action: "percent_sampler".to_string(),
                reason: format!("percent must be in ]0, 100], not {percent}"),
            });
        }
        Ok(PercentSamplerAggregateAction { percent })
    }
}

impl BuiltinAction for PercentSamplerAggregateAction {
    fn name(&self) -> &str {
        "percent_sampler"
    }

    fn set_config(
        &mut self,
        settings: Value,
        _evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<(), ConfigError> {
        let settings: PercentSamplerAggregateAction = parse_settings(self.name(), settings)?;
        *self = Self::try_new(settings.percent)?;
        Ok(())
    }
}

impl AggregateAction for PercentSamplerAggregateAction {
    fn handle_event(
        &self,
        event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError> {
        let sampled = input
            .group_state_mut()
            .extension_or_insert_with(SampledEvents::default);
        sampled.total += 1;
        if (sampled.allowed as f64) * 100.0 < self.percent * (sampled.total as f64) {
            sampled.allowed += 1;
            return Ok(AggregateActionResponse::from_event(event.clone()));
        }
        Ok(AggregateActionResponse::null_event_response())
    }
}
