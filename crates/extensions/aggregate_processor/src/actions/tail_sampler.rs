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

/// Holds back the events of each window, deciding at the end of the window whether to emit them
///
/// All the events of a window are emitted if any matches the `condition`,
/// otherwise they are emitted with a probability of `percent`%, and dropped otherwise.
///
/// There is no `wait_period` setting: the decision is deferred until the group window concludes,
/// so the `group_duration` of the processor is the time given to the late events of a trace.
/// An event received after the decision starts a new window.
#[derive(Clone, Default)]
pub struct TailSamplerAggregateAction {
    percent: f64,
    condition: Option<String>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TailSamplerSettings {
    percent: f64,

    #[serde(default)]
    condition: Option<String>,
}

#[derive(Default)]
struct BufferedEvents {
    events: Vec<Event>,
    condition_matched: bool,
}

impl TailSamplerAggregateAction {
    pub fn try_new(
        percent: f64,
        condition: Option<String>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Result<Self, ConfigError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(ConfigError::InvalidSettings {
                action: "tail_sampler".to_string(),
                reason: format!("percent must be in [0, 100], not {percent}"),
            });
        }
        Ok(TailSamplerAggregateAction {
            percent,
            condition,
            evaluator: Some(evaluator),
        })
    }

    fn matches_condition(&self, event: &Event) -> Result<bool, ActionError> {
        match (&self.condition, &self.evaluator) {
            (Some(condition), Some(evaluator)) => Ok(evaluator.evaluate(condition, event)?),
            _ => Ok(false),
        }
    }
}

impl BuiltinAction for TailSamplerAggregateAction {
    fn name(&self) -> &str {
        "tail_sampler"
    }

    fn set_config(
        &mut self,
        settings: Value,
        evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<(), ConfigError> {
        let settings: TailSamplerSettings = parse_settings(self.name(), settings)?;
        *self = Self::try_new(settings.percent, settings.condition, evaluator.clone())?;
        Ok(())
    }
}

impl AggregateAction for TailSamplerAggregateAction {
    fn handle_event(
        &self,
        event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError> {
        let matched = self.matches_condition(event)?;
        let buffered = input
            .group_state_mut()
            .extension_or_insert_with(BufferedEvents::default);
        buffered.condition_matched |= matched;
        buffered.events.push(event.clone());
        Ok(AggregateActionResponse::null_event_response())
    }

    fn conclude_group(
        &self,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionOutput, ActionError> {
        let Some(buffered) = input.group_state_mut().remove_extension::<BufferedEvents>() else {
            return Ok(AggregateActionOutput::default());
        };
        if buffered.condition_matched || rand::random::<f64>() * 100.0 < self.percent {
            return Ok(AggregateActionOutput::new(buffered.events));
        }
        Ok(AggregateActionOutput::default())
    }
}
