use crate::AggregateActionInput;
use prepper_api::Event;
use prepper_api::EventError;
use prepper_api::ExpressionError;

/// The aggregation logic applied to the events of each group
///
/// An action is shared by all the groups: any per-group data must be kept in the group state.
/// The calls for a given group are serialized, but the calls for distinct groups run concurrently.
#[cfg_attr(test, mockall::automock)]
pub trait AggregateAction: Send + Sync + 'static {
    /// Process an event of the group, possibly emitting an event right away
    fn handle_event(
        &self,
        event: &Event,
        input: &mut AggregateActionInput,
    ) -> Result<AggregateActionResponse, ActionError>;

    /// Close the window of the group, returning the aggregated events if any
    fn conclude_group(
        &self,
        _input: &mut AggregateActionInput,
    ) -> Result<AggregateActionOutput, ActionError> {
        Ok(AggregateActionOutput::default())
    }
}

/// The outcome of an event handling: either an event to emit now or nothing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregateActionResponse {
    event: Option<Event>,
}

/// The events emitted when a window is concluded
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregateActionOutput {
    events: Vec<Event>,
}

#[derive(thiserror::Error, Debug)]
pub enum ActionError {
    #[error(transparent)]
    InvalidEvent(#[from] EventError),

    #[error(transparent)]
    InvalidCondition(#[from] ExpressionError),

    #[error("{0}")]
    Failed(String),
}

impl AggregateActionResponse {
    pub fn from_event(event: Event) -> Self {
        AggregateActionResponse { event: Some(event) }
    }

    /// The event has been absorbed by the aggregation
    pub fn null_event_response() -> Self {
        AggregateActionResponse { event: None }
    }

    pub fn event(&self) -> Option<&Event> {
        self.event.as_ref()
    }

    pub fn into_event(self) -> Option<Event> {
        self.event
    }
}

impl AggregateActionOutput {
    pub fn new(events: Vec<Event>) -> Self {
        AggregateActionOutput { events }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl From<Event> for AggregateActionOutput {
    fn from(event: Event) -> Self {
        AggregateActionOutput::new(vec![event])
    }
}
