//! Aggregation of events over time windows.
//!
//! Events are grouped by the values of their identification keys.
//! Each group is an aggregation window, with some state updated by an [AggregateAction]
//! for each event of the group and finally used to conclude the window.
//!
//! The [AggregateProcessor] is shared by concurrent workers:
//! the events of distinct groups are processed in parallel,
//! while the operations on a given group are serialized by an [AggregateActionSynchronizer].
mod action;
pub mod actions;
pub mod config;
mod group;
mod group_manager;
mod identification;
mod processor;
mod synchronizer;

pub use crate::action::ActionError;
pub use crate::action::AggregateAction;
pub use crate::action::AggregateActionOutput;
pub use crate::action::AggregateActionResponse;
pub use crate::actions::BuiltinActions;
pub use crate::config::AggregateProcessorConfig;
pub use crate::config::ConfigError;
pub use crate::group::AggregateActionInput;
pub use crate::group::AggregateGroup;
pub use crate::group::GroupState;
pub use crate::group_manager::AggregateGroupManager;
pub use crate::identification::IdentificationKeysHasher;
pub use crate::identification::IdentificationKeysMap;
pub use crate::processor::AggregateProcessor;
pub use crate::processor::ACTION_CONCLUDE_GROUP_EVENTS_DROPPED;
pub use crate::processor::ACTION_CONCLUDE_GROUP_EVENTS_OUT;
pub use crate::processor::ACTION_HANDLE_EVENTS_DROPPED;
pub use crate::processor::ACTION_HANDLE_EVENTS_OUT;
pub use crate::synchronizer::AggregateActionSynchronizer;
pub use crate::synchronizer::ACTION_CONCLUDE_GROUP_ERRORS;
pub use crate::synchronizer::ACTION_HANDLE_ERRORS;
