use arrow_schema::{ArrowError, DataType};
use thiserror::Error;

/// Errors surfaced by the merge subsystem.
///
/// Data conditions observed during selection (oversized parts, overlaps,
/// month-spanning parts, missing disk headroom) are logged and skipped, not
/// returned; the variants here are invariant violations and I/O failures.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Underlying store I/O failed.
    #[error("merge io error: {0}")]
    Io(#[from] std::io::Error),
    /// Block construction or projection failed.
    #[error("merge arrow error: {0}")]
    Arrow(#[from] ArrowError),
    /// A referenced column is absent from the table schema.
    #[error("unknown column {0:?} in table schema")]
    UnknownColumn(String),
    /// A column type the merge path cannot read or rebuild.
    #[error("unsupported column type {0:?} in merge path")]
    UnsupportedType(DataType),
    /// Collapsing mode was configured without a sign column.
    #[error("collapsing merge requires a sign column")]
    MissingSignColumn,
    /// The sign column held something other than +1/-1.
    #[error("unexpected sign value {0} in collapsing merge")]
    UnexpectedSign(String),
    /// Summing attempted over cells of different types.
    #[error("cannot sum mismatched cell types")]
    CellTypeMismatch,
    /// The executor was invoked with an empty run.
    #[error("merge executor received no input parts")]
    NoInputs,
    /// Two parts of an already-selected run overlap by key range.
    #[error("input parts {0} and {1} overlap")]
    OverlappingRun(String, String),
    /// Two parts of an already-selected run belong to different partitions.
    #[error("input parts {0} and {1} belong to different partitions")]
    PartitionMismatch(String, String),
    /// A part covers more than one calendar month.
    #[error("part {0} spans more than one month")]
    PartSpansMonths(String),
    /// `replace_parts` was asked to remove a part the set does not hold.
    #[error("part {0} is not in the part set")]
    MissingPart(String),
    /// `replace_parts` inputs are not adjacent in the part set.
    #[error("parts being replaced are not adjacent in the part set")]
    NonContiguousRun,
    /// An ordinary merge produced zero marks; rows may never be lost.
    #[error("empty part after merge in ordinary mode")]
    EmptyOrdinaryOutput,
    /// The rematerialized index disagrees with the written mark count.
    #[error("index of part {name} has {actual} entries for {expected} marks")]
    IndexMismatch {
        /// Name of the freshly written part.
        name: String,
        /// Marks reported by the writer.
        expected: u64,
        /// Entries found in the re-read index.
        actual: u64,
    },
    /// The store has no data for the requested part.
    #[error("unknown part {0} in part store")]
    UnknownPart(String),
    /// A block's schema does not match the table schema.
    #[error("block schema does not match table schema")]
    SchemaMismatch,
}
