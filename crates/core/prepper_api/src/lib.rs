//! Building blocks shared by the processors of a pipeline.
//!
//! A pipeline moves batches of [Record]s wrapping [Event]s through a chain of [Processor]s.
//! The collaborators a processor depends on are defined here at their boundary:
//! an [ExpressionEvaluator] for conditional processing and [PluginMetrics] for statistics.

pub mod event;
pub mod expression;
pub mod metrics;
mod processor;
mod record;

pub use crate::event::Event;
pub use crate::event::EventError;
pub use crate::expression::ExpressionError;
pub use crate::expression::ExpressionEvaluator;
pub use crate::expression::SimpleExpressionEvaluator;
pub use crate::metrics::Counter;
pub use crate::metrics::PluginMetrics;
pub use crate::metrics::Timer;
pub use crate::processor::Processor;
pub use crate::record::Record;
