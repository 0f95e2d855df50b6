//! Streaming access to part data.
//!
//! The on-disk column format is owned by collaborators; the merge executor
//! only consumes these seams: a source of sorted blocks per input part and
//! a sink for the merged output.

use arrow_array::RecordBatch;
use async_trait::async_trait;

use crate::{block::SortKey, error::MergeError, part::Part};

/// Half-open range of index marks, `begin..end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkRange {
    /// First mark to read.
    pub begin: u64,
    /// One past the last mark to read.
    pub end: u64,
}

impl MarkRange {
    /// The range covering every mark of `part`.
    pub fn full(part: &Part) -> Self {
        Self {
            begin: 0,
            end: part.size,
        }
    }
}

/// Ordered stream of blocks read from one part.
#[async_trait]
pub trait BlockSource: Send {
    /// Prepare the stream; called once before the first [`BlockSource::read`].
    async fn read_prefix(&mut self) -> Result<(), MergeError> {
        Ok(())
    }

    /// Yield the next block in the part's sort order, or `None` at the end.
    async fn read(&mut self) -> Result<Option<RecordBatch>, MergeError>;

    /// Release the stream after a complete read; skipped on cancellation.
    async fn read_suffix(&mut self) -> Result<(), MergeError> {
        Ok(())
    }
}

/// Sink writing blocks of one new part.
///
/// Dropping a sink without [`BlockSink::write_suffix`] discards the partial
/// output; nothing becomes visible to readers.
#[async_trait]
pub trait BlockSink: Send {
    /// Prepare the sink; called once before the first [`BlockSink::write`].
    async fn write_prefix(&mut self) -> Result<(), MergeError> {
        Ok(())
    }

    /// Append one block to the part being written.
    async fn write(&mut self, block: RecordBatch) -> Result<(), MergeError>;

    /// Finalize the part and make its data durable in the store.
    async fn write_suffix(&mut self) -> Result<(), MergeError>;

    /// Index marks written so far.
    fn marks_count(&self) -> u64;

    /// Bytes written so far.
    fn bytes_written(&self) -> u64;
}

/// Factory for part readers and writers plus index access.
#[async_trait]
pub trait PartStore: Send + Sync {
    /// Open a sorted block stream over `part`, restricted to `range` and
    /// projecting `columns`.
    async fn reader(
        &self,
        part: &Part,
        range: MarkRange,
        columns: &[String],
    ) -> Result<Box<dyn BlockSource>, MergeError>;

    /// Create a sink for the output part described by `part`.
    async fn writer(&self, part: &Part) -> Result<Box<dyn BlockSink>, MergeError>;

    /// Re-read the sparse index of a written part: one sort key per mark.
    async fn read_index(&self, name: &str) -> Result<Vec<SortKey>, MergeError>;
}
