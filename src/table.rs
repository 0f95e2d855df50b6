//! Table-level configuration consumed by the merge subsystem.

use std::{fmt, sync::Arc};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

use crate::{error::MergeError, option::MergeOptions};

/// Row-combining policy applied while merging parts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// Pass every row through; rows are never dropped.
    #[default]
    Ordinary,
    /// Cancel +1/-1 sign pairs with equal sort keys; the net sign survives.
    Collapsing,
    /// Combine rows with equal sort keys by summing non-key numeric columns.
    Summing,
}

/// Key-preserving transform applied to each input stream before merging.
///
/// The original use is materializing computed sort-key columns. The contract
/// requires that row order within a block is preserved and the output schema
/// equals the table schema.
pub trait BlockExpression: Send + Sync {
    /// Evaluate the expression over one block.
    fn evaluate(&self, block: RecordBatch) -> Result<RecordBatch, MergeError>;
}

/// Static description of the merged table: schema, sort order, combining
/// mode, and the selection knobs.
#[derive(Clone)]
pub struct TableConfig {
    schema: SchemaRef,
    sort_columns: Vec<String>,
    sort_indices: Vec<usize>,
    mode: MergeMode,
    sign_column: Option<String>,
    index_granularity: u64,
    primary_expression: Option<Arc<dyn BlockExpression>>,
    options: MergeOptions,
}

impl TableConfig {
    /// Build a config for `schema` sorted by `sort_columns` (prefix order is
    /// significant). Fails when a sort column is absent from the schema.
    pub fn new(schema: SchemaRef, sort_columns: Vec<String>) -> Result<Self, MergeError> {
        let sort_indices = sort_columns
            .iter()
            .map(|name| {
                schema
                    .index_of(name)
                    .map_err(|_| MergeError::UnknownColumn(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema,
            sort_columns,
            sort_indices,
            mode: MergeMode::default(),
            sign_column: None,
            index_granularity: 8192,
            primary_expression: None,
            options: MergeOptions::default(),
        })
    }

    /// Set the row-combining mode.
    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the +1/-1 sign column consulted by collapsing merges.
    pub fn with_sign_column(mut self, name: impl Into<String>) -> Self {
        self.sign_column = Some(name.into());
        self
    }

    /// Set the number of rows covered by one index mark.
    pub fn with_index_granularity(mut self, rows: u64) -> Self {
        self.index_granularity = rows.max(1);
        self
    }

    /// Install a key-preserving expression applied to every input stream.
    pub fn with_primary_expression(mut self, expression: Arc<dyn BlockExpression>) -> Self {
        self.primary_expression = Some(expression);
        self
    }

    /// Replace the merge selection knobs.
    pub fn with_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    /// Arrow schema of the table.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Sort description column names, most significant first.
    pub fn sort_columns(&self) -> &[String] {
        &self.sort_columns
    }

    pub(crate) fn sort_indices(&self) -> &[usize] {
        &self.sort_indices
    }

    /// Configured row-combining mode.
    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    /// Sign column name, when configured.
    pub fn sign_column(&self) -> Option<&str> {
        self.sign_column.as_deref()
    }

    /// Rows per index mark.
    pub fn index_granularity(&self) -> u64 {
        self.index_granularity
    }

    pub(crate) fn primary_expression(&self) -> Option<&Arc<dyn BlockExpression>> {
        self.primary_expression.as_ref()
    }

    /// Merge selection knobs.
    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Every column name of the table, in schema order.
    pub fn column_names(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect()
    }
}

impl fmt::Debug for TableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableConfig")
            .field("schema", &self.schema)
            .field("sort_columns", &self.sort_columns)
            .field("mode", &self.mode)
            .field("sign_column", &self.sign_column)
            .field("index_granularity", &self.index_granularity)
            .field(
                "primary_expression",
                &self.primary_expression.as_ref().map(|_| "<expression>"),
            )
            .field("options", &self.options)
            .finish()
    }
}
