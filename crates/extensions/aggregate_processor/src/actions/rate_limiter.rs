use crate::actions::parse_settings;
use crate::actions::BuiltinAction;
use crate::config::ConfigError;
use crate::ActionError;
use crate::AggregateAction;
use crate::AggregateActionInput;
use crate::AggregateActionResponse;
use clock::Clock;
use clock::WallClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::state::NotKeyed;
use governor::Quota;
use governor::RateLimiter;
use prepper_api::Event;
use prepper_api::ExpressionEvaluator;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

type GroupRateLimiter = RateLimiter<NotKeyed, InMemoryState, LimiterClock, NoOpMiddleware<Instant>>;

/// Limits the rate of the events of each group
///
/// The events exceeding `events_per_second` are either dropped
/// or held back till the rate allows them through.
/// Nothing is emitted when a window is concluded.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterAggregateAction {
    events_per_second: NonZeroU32,

    #[serde(default)]
    when_exceeds: RateLimiterMode,

    #[serde(skip, default)]
    clock: LimiterClock,
}

/// The time source of the rate limiters
#[derive(Clone)]
struct LimiterClock(Arc<dyn Clock>);

impl Default for LimiterClock {
    fn default() -> Self {
        LimiterClock(Arc::new(WallClock))
    }
}

impl fmt::Debug for LimiterClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LimiterClock")
    }
}

impl governor::clock::Clock for LimiterClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        self.0.now()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimiterMode {
    #[default]
    Block,
    Drop,
}

impl Default for RateLimiterAggregateAction {
    fn default() -> Self {
        RateLimiterAggregateAction {
            events_per_second: NonZeroU32::MIN,
            when_exceeds: RateLimiterMode::default(),
            clock: LimiterClock::default(),
        }
    }
}

impl RateLimiterAggregateAction {
    pub fn new(events_per_second: NonZeroU32, when_exceeds: RateLimiterMode) -> Self {
        RateLimiterAggregateAction {
            events_per_second,
            when_exceeds,
            clock: LimiterClock::default(),
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        RateLimiterAggregateAction {
            clock: LimiterClock(clock),
            ..self
        }
    }

    fn new_rate_limiter(&self) -> GroupRateLimiter {
        let quota = Quota::per_second(self.events_per_second).allow_burst(NonZeroU32::MIN);
        RateLimiter::direct_with_clock(quota, &self.clock)
    }
}

impl BuiltinAction for RateLimiterAggregateAction {
    fn name(&self) -> &str {
        "rate_limiter"
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

impl AggregateAction for RateLimiterAggregateAction {
    fn handle_event(
        &self,
        event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError> {
        let limiter = input
            .group_state_mut()
            .extension_or_insert_with(|| self.new_rate_limiter());

        match self.when_exceeds {
            RateLimiterMode::Drop => {
                if limiter.check().is_err() {
                    return Ok(AggregateActionResponse::null_event_response());
                }
            }
            RateLimiterMode::Block => {
                while let Err(not_until) = limiter.check() {
                    std::thread::sleep(not_until.wait_time_from(self.clock.0.now()));
                }
            }
        }
        Ok(AggregateActionResponse::from_event(event.clone()))
    }
}
