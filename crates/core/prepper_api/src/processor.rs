use crate::Event;
use crate::Record;

/// A pipeline stage transforming batches of records.
///
/// A processor is shared by all the worker threads of a pipeline:
/// `execute` is called concurrently, each call with its own batch.
pub trait Processor: Send + Sync {
    /// Process a batch, returning zero, one or more records per input record
    fn execute(&self, records: Vec<Record<Event>>) -> Vec<Record<Event>>;

    /// Notify the processor that no more input is expected.
    ///
    /// From now on the processor is expected to flush any buffered data
    /// on the subsequent calls to `execute`.
    fn prepare_for_shutdown(&self) {}

    /// Tell if all the buffered data has been flushed
    fn is_ready_for_shutdown(&self) -> bool {
        true
    }

    fn shutdown(&self) {}
}
