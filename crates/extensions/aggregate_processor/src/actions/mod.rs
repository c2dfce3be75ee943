use crate::config::ConfigError;
use crate::AggregateAction;
use prepper_api::ExpressionEvaluator;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

mod append;
mod count;
mod histogram;
mod percent_sampler;
mod put_all;
mod rate_limiter;
mod remove_duplicates;
mod tail_sampler;

pub use append::AppendAggregateAction;
pub use count::CountAggregateAction;
pub use histogram::HistogramAggregateAction;
pub use histogram::HistogramOutputFormat;
pub use percent_sampler::PercentSamplerAggregateAction;
pub use put_all::PutAllAggregateAction;
pub use rate_limiter::RateLimiterAggregateAction;
pub use rate_limiter::RateLimiterMode;
pub use remove_duplicates::RemoveDuplicatesAggregateAction;
pub use tail_sampler::TailSamplerAggregateAction;

/// An aggregate action that can be registered as a builtin
pub trait BuiltinAction: AggregateAction + Clone {
    fn name(&self) -> &str;

    fn set_config(
        &mut self,
        settings: Value,
        evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<(), ConfigError>;
}

pub trait ActionBuilder: Send + Sync + 'static {
    fn new_instance(
        &self,
        settings: Value,
        evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<Arc<dyn AggregateAction>, ConfigError>;
}

impl<T: BuiltinAction> ActionBuilder for T {
    fn new_instance(
        &self,
        settings: Value,
        evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<Arc<dyn AggregateAction>, ConfigError> {
        let mut action = self.clone();
        action.set_config(settings, evaluator)?;
        Ok(Arc::new(action))
    }
}

pub struct BuiltinActions {
    actions: HashMap<String, Box<dyn ActionBuilder>>,
}

impl Default for BuiltinActions {
    fn default() -> Self {
        let mut actions = BuiltinActions {
            actions: HashMap::default(),
        };
        actions.register(AppendAggregateAction::default());
        actions.register(CountAggregateAction::default());
        actions.register(HistogramAggregateAction::default());
        actions.register(PercentSamplerAggregateAction::default());
        actions.register(PutAllAggregateAction);
        actions.register(RateLimiterAggregateAction::default());
        actions.register(RemoveDuplicatesAggregateAction);
        actions.register(TailSamplerAggregateAction::default());
        actions
    }
}

impl BuiltinActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, prototype: impl BuiltinAction) {
        self.actions
            .insert(prototype.name().to_owned(), Box::new(prototype));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn new_instance(
        &self,
        name: &str,
        settings: Value,
        evaluator: &Arc<dyn ExpressionEvaluator>,
    ) -> Result<Arc<dyn AggregateAction>, ConfigError> {
        let Some(builder) = self.actions.get(name) else {
            return Err(ConfigError::UnknownAction { name: name.into() });
        };
        builder.new_instance(settings, evaluator)
    }
}

/// Settings of the actions having none
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NoSettings {}

/// Deserialize the settings of an action, missing settings meaning all defaults
pub(crate) fn parse_settings<T: DeserializeOwned>(
    action: &str,
    settings: Value,
) -> Result<T, ConfigError> {
    let settings = match settings {
        Value::Null => Value::Object(Default::default()),
        settings => settings,
    };
    serde_json::from_value(settings).map_err(|err| ConfigError::InvalidSettings {
        action: action.to_string(),
        reason: err.to_string(),
    })
}
