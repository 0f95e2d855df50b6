//! Streaming k-way merge with row-combining modes.
//!
//! Sources are consumed through a binary heap keyed by the sort-column
//! tuple; ties break by source index, so rows with equal keys leave in
//! input-part order. The combiner decides what each popped row contributes
//! to the output: everything (ordinary), the net sign survivor of a key
//! group (collapsing), or one summed row per key group (summing).

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc};

use arrow_array::RecordBatch;
use async_trait::async_trait;
use log::Level;

use crate::{
    block::{is_summable, row_at, sort_key_at, BlockBuilder, SortKey, Value},
    error::MergeError,
    logging::grist_log,
    part::store::BlockSource,
    table::{BlockExpression, MergeMode, TableConfig},
};

/// Rows per block on both the read and write side of a merge.
pub(crate) const DEFAULT_MERGE_BLOCK_SIZE: usize = 8192;

struct HeapEntry {
    key: SortKey,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

struct SourceCursor {
    source: Box<dyn BlockSource>,
    batch: Option<RecordBatch>,
    row: usize,
}

impl SourceCursor {
    fn new(source: Box<dyn BlockSource>) -> Self {
        Self {
            source,
            batch: None,
            row: 0,
        }
    }

    async fn ensure_batch(&mut self) -> Result<(), MergeError> {
        loop {
            if let Some(batch) = &self.batch {
                if self.row < batch.num_rows() {
                    return Ok(());
                }
            }
            match self.source.read().await? {
                Some(batch) => {
                    self.batch = Some(batch);
                    self.row = 0;
                }
                None => {
                    self.batch = None;
                    return Ok(());
                }
            }
        }
    }

    fn key(&self, sort_indices: &[usize]) -> Result<Option<SortKey>, MergeError> {
        match &self.batch {
            Some(batch) if self.row < batch.num_rows() => {
                sort_key_at(batch, sort_indices, self.row).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn take_row(&mut self) -> Result<Vec<Value>, MergeError> {
        let batch = self
            .batch
            .as_ref()
            .expect("cursor holds a batch while queued in the heap");
        let row = row_at(batch, self.row)?;
        self.row += 1;
        Ok(row)
    }
}

struct CollapseGroup {
    key: SortKey,
    first_negative: Option<Vec<Value>>,
    last_positive: Option<Vec<Value>>,
    positives: u64,
    negatives: u64,
}

struct SumGroup {
    key: SortKey,
    row: Vec<Value>,
}

enum Combiner {
    Ordinary,
    Collapsing {
        sign_index: usize,
        group: Option<CollapseGroup>,
    },
    Summing {
        numeric: Vec<usize>,
        group: Option<SumGroup>,
    },
}

impl Combiner {
    fn for_table(table: &TableConfig) -> Result<Self, MergeError> {
        match table.mode() {
            MergeMode::Ordinary => Ok(Combiner::Ordinary),
            MergeMode::Collapsing => {
                let name = table.sign_column().ok_or(MergeError::MissingSignColumn)?;
                let sign_index = table
                    .schema()
                    .index_of(name)
                    .map_err(|_| MergeError::UnknownColumn(name.to_owned()))?;
                Ok(Combiner::Collapsing {
                    sign_index,
                    group: None,
                })
            }
            MergeMode::Summing => {
                let sort_indices = table.sort_indices();
                let numeric = table
                    .schema()
                    .fields()
                    .iter()
                    .enumerate()
                    .filter(|(index, field)| {
                        !sort_indices.contains(index) && is_summable(field.data_type())
                    })
                    .map(|(index, _)| index)
                    .collect();
                Ok(Combiner::Summing {
                    numeric,
                    group: None,
                })
            }
        }
    }

    fn push(
        &mut self,
        key: SortKey,
        row: Vec<Value>,
        out: &mut BlockBuilder,
    ) -> Result<(), MergeError> {
        match self {
            Combiner::Ordinary => out.append_row(&row),
            Combiner::Collapsing { sign_index, group } => {
                if group.as_ref().is_some_and(|current| current.key != key) {
                    flush_collapse(group.take(), out)?;
                }
                let current = group.get_or_insert_with(|| CollapseGroup {
                    key,
                    first_negative: None,
                    last_positive: None,
                    positives: 0,
                    negatives: 0,
                });
                match row.get(*sign_index).and_then(Value::as_i64) {
                    Some(sign) if sign > 0 => {
                        current.positives += 1;
                        current.last_positive = Some(row);
                    }
                    Some(sign) if sign < 0 => {
                        current.negatives += 1;
                        if current.first_negative.is_none() {
                            current.first_negative = Some(row);
                        }
                    }
                    other => {
                        return Err(MergeError::UnexpectedSign(format!("{other:?}")));
                    }
                }
                Ok(())
            }
            Combiner::Summing { numeric, group } => {
                if group.as_ref().is_some_and(|current| current.key != key) {
                    flush_sum(group.take(), out)?;
                }
                match group {
                    Some(current) => {
                        for index in numeric.iter() {
                            current.row[*index].add_assign(&row[*index])?;
                        }
                        Ok(())
                    }
                    None => {
                        *group = Some(SumGroup { key, row });
                        Ok(())
                    }
                }
            }
        }
    }

    fn flush(&mut self, out: &mut BlockBuilder) -> Result<(), MergeError> {
        match self {
            Combiner::Ordinary => Ok(()),
            Combiner::Collapsing { group, .. } => flush_collapse(group.take(), out),
            Combiner::Summing { group, .. } => flush_sum(group.take(), out),
        }
    }
}

fn flush_collapse(group: Option<CollapseGroup>, out: &mut BlockBuilder) -> Result<(), MergeError> {
    let Some(group) = group else {
        return Ok(());
    };
    if group.positives.abs_diff(group.negatives) > 1 {
        grist_log!(
            Level::Warn,
            "collapse",
            "incorrect collapsing data: {} positive and {} negative rows share a sort key",
            group.positives,
            group.negatives,
        );
    }
    match group.positives.cmp(&group.negatives) {
        Ordering::Equal => Ok(()),
        Ordering::Greater => {
            let row = group
                .last_positive
                .expect("positive surplus implies a positive row");
            out.append_row(&row)
        }
        Ordering::Less => {
            let row = group
                .first_negative
                .expect("negative surplus implies a negative row");
            out.append_row(&row)
        }
    }
}

fn flush_sum(group: Option<SumGroup>, out: &mut BlockBuilder) -> Result<(), MergeError> {
    match group {
        Some(group) => out.append_row(&group.row),
        None => Ok(()),
    }
}

/// K-way merge over part streams, combining rows per the table's mode.
pub(crate) struct MergingStream {
    sources: Vec<SourceCursor>,
    heap: BinaryHeap<HeapEntry>,
    builder: BlockBuilder,
    combiner: Combiner,
    sort_indices: Vec<usize>,
    block_size: usize,
}

impl MergingStream {
    pub(crate) fn new(
        sources: Vec<Box<dyn BlockSource>>,
        table: &TableConfig,
        block_size: usize,
    ) -> Result<Self, MergeError> {
        Ok(Self {
            sources: sources.into_iter().map(SourceCursor::new).collect(),
            heap: BinaryHeap::new(),
            builder: BlockBuilder::new(Arc::clone(table.schema()))?,
            combiner: Combiner::for_table(table)?,
            sort_indices: table.sort_indices().to_vec(),
            block_size: block_size.max(1),
        })
    }

    /// Open every source and prime the heap with their first keys.
    pub(crate) async fn read_prefix(&mut self) -> Result<(), MergeError> {
        for (index, cursor) in self.sources.iter_mut().enumerate() {
            cursor.source.read_prefix().await?;
            cursor.ensure_batch().await?;
            if let Some(key) = cursor.key(&self.sort_indices)? {
                self.heap.push(HeapEntry { key, source: index });
            }
        }
        Ok(())
    }

    /// Produce the next merged block, or `None` when the inputs are drained.
    pub(crate) async fn read(&mut self) -> Result<Option<RecordBatch>, MergeError> {
        while let Some(entry) = self.heap.pop() {
            let cursor = &mut self.sources[entry.source];
            let row = cursor.take_row()?;
            self.combiner.push(entry.key, row, &mut self.builder)?;
            cursor.ensure_batch().await?;
            if let Some(key) = cursor.key(&self.sort_indices)? {
                self.heap.push(HeapEntry {
                    key,
                    source: entry.source,
                });
            }
            if self.builder.len() >= self.block_size {
                return self.builder.finish().map(Some);
            }
        }
        self.combiner.flush(&mut self.builder)?;
        if self.builder.is_empty() {
            return Ok(None);
        }
        self.builder.finish().map(Some)
    }

    /// Close every source after a complete read.
    pub(crate) async fn read_suffix(&mut self) -> Result<(), MergeError> {
        for cursor in &mut self.sources {
            cursor.source.read_suffix().await?;
        }
        Ok(())
    }
}

/// Source adapter applying the table's primary expression to every block.
pub(crate) struct ExpressionBlockSource {
    inner: Box<dyn BlockSource>,
    expression: Arc<dyn BlockExpression>,
}

impl ExpressionBlockSource {
    pub(crate) fn new(inner: Box<dyn BlockSource>, expression: Arc<dyn BlockExpression>) -> Self {
        Self { inner, expression }
    }
}

#[async_trait]
impl BlockSource for ExpressionBlockSource {
    async fn read_prefix(&mut self) -> Result<(), MergeError> {
        self.inner.read_prefix().await
    }

    async fn read(&mut self) -> Result<Option<RecordBatch>, MergeError> {
        match self.inner.read().await? {
            Some(block) => self.expression.evaluate(block).map(Some),
            None => Ok(None),
        }
    }

    async fn read_suffix(&mut self) -> Result<(), MergeError> {
        self.inner.read_suffix().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use arrow_array::{Int64Array, Int8Array, UInt64Array};
    use arrow_schema::{DataType, Field, Schema, SchemaRef};

    use super::*;
    use crate::block::value_at;

    struct VecSource {
        blocks: VecDeque<RecordBatch>,
    }

    impl VecSource {
        fn boxed(blocks: Vec<RecordBatch>) -> Box<dyn BlockSource> {
            Box::new(Self {
                blocks: blocks.into(),
            })
        }
    }

    #[async_trait]
    impl BlockSource for VecSource {
        async fn read(&mut self) -> Result<Option<RecordBatch>, MergeError> {
            Ok(self.blocks.pop_front())
        }
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("v", DataType::Int64, false),
        ]))
    }

    fn block(schema: &SchemaRef, ids: &[u64], values: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            Arc::clone(schema),
            vec![
                Arc::new(UInt64Array::from(ids.to_vec())),
                Arc::new(Int64Array::from(values.to_vec())),
            ],
        )
        .unwrap()
    }

    async fn drain(stream: &mut MergingStream) -> Vec<(u64, i64)> {
        let mut rows = Vec::new();
        stream.read_prefix().await.unwrap();
        while let Some(block) = stream.read().await.unwrap() {
            for row in 0..block.num_rows() {
                let id = match value_at(block.column(0).as_ref(), row).unwrap() {
                    Value::UInt64(v) => v,
                    other => panic!("unexpected id cell {other:?}"),
                };
                let v = match value_at(block.column(1).as_ref(), row).unwrap() {
                    Value::Int64(v) => v,
                    other => panic!("unexpected value cell {other:?}"),
                };
                rows.push((id, v));
            }
        }
        stream.read_suffix().await.unwrap();
        rows
    }

    #[tokio::test]
    async fn ordinary_merge_is_globally_sorted_and_source_stable() {
        let schema = schema();
        let table = TableConfig::new(Arc::clone(&schema), vec!["id".into()]).unwrap();
        let sources = vec![
            VecSource::boxed(vec![block(&schema, &[1, 3], &[10, 10]), block(&schema, &[5], &[10])]),
            VecSource::boxed(vec![block(&schema, &[1, 2, 5], &[20, 20, 20])]),
        ];
        let mut stream = MergingStream::new(sources, &table, 4).unwrap();
        let rows = drain(&mut stream).await;
        assert_eq!(
            rows,
            vec![(1, 10), (1, 20), (2, 20), (3, 10), (5, 10), (5, 20)]
        );
    }

    #[tokio::test]
    async fn summing_merge_combines_key_groups() {
        let schema = schema();
        let table = TableConfig::new(Arc::clone(&schema), vec!["id".into()])
            .unwrap()
            .with_mode(MergeMode::Summing);
        let sources = vec![
            VecSource::boxed(vec![block(&schema, &[1, 2], &[5, 1])]),
            VecSource::boxed(vec![block(&schema, &[1, 3], &[7, 2])]),
        ];
        let mut stream = MergingStream::new(sources, &table, 8192).unwrap();
        let rows = drain(&mut stream).await;
        assert_eq!(rows, vec![(1, 12), (2, 1), (3, 2)]);
    }

    #[tokio::test]
    async fn collapsing_merge_cancels_sign_pairs() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("sign", DataType::Int8, false),
        ]));
        let table = TableConfig::new(Arc::clone(&schema), vec!["id".into()])
            .unwrap()
            .with_mode(MergeMode::Collapsing)
            .with_sign_column("sign");
        let signed = |ids: &[u64], signs: &[i8]| {
            RecordBatch::try_new(
                Arc::clone(&schema),
                vec![
                    Arc::new(UInt64Array::from(ids.to_vec())),
                    Arc::new(Int8Array::from(signs.to_vec())),
                ],
            )
            .unwrap()
        };
        let sources = vec![
            VecSource::boxed(vec![signed(&[1, 2], &[1, 1])]),
            VecSource::boxed(vec![signed(&[1, 3], &[-1, 1])]),
        ];
        let mut stream = MergingStream::new(sources, &table, 8192).unwrap();
        stream.read_prefix().await.unwrap();

        let mut survivors = Vec::new();
        while let Some(block) = stream.read().await.unwrap() {
            for row in 0..block.num_rows() {
                survivors.push(value_at(block.column(0).as_ref(), row).unwrap());
            }
        }
        assert_eq!(survivors, vec![Value::UInt64(2), Value::UInt64(3)]);
    }

    #[tokio::test]
    async fn cuts_blocks_at_configured_size() {
        let schema = schema();
        let table = TableConfig::new(Arc::clone(&schema), vec!["id".into()]).unwrap();
        let sources = vec![VecSource::boxed(vec![block(
            &schema,
            &[1, 2, 3, 4, 5],
            &[0, 0, 0, 0, 0],
        )])];
        let mut stream = MergingStream::new(sources, &table, 2).unwrap();
        stream.read_prefix().await.unwrap();

        let mut block_sizes = Vec::new();
        while let Some(block) = stream.read().await.unwrap() {
            block_sizes.push(block.num_rows());
        }
        assert_eq!(block_sizes, vec![2, 2, 1]);
    }
}
