//! Merge execution: read a selected run, combine it, publish the output.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use log::Level;

use crate::{
    error::MergeError,
    logging::grist_log,
    merge::{
        selector::{MergeClock, MergeSelector, SelectorFlags},
        space,
        stream::{ExpressionBlockSource, MergingStream, DEFAULT_MERGE_BLOCK_SIZE},
    },
    part::{
        set::PartSet,
        store::{BlockSource, MarkRange, PartStore},
        Part, PartRef,
    },
    table::{MergeMode, TableConfig},
};

/// Background merge worker surface: selects runs over the live part set and
/// merges them into new parts.
///
/// One `PartMerger` may serve several worker threads; the `can_merge`
/// predicate passed to selection is expected to keep any part in at most one
/// in-flight merge. Cancellation is sticky: once [`PartMerger::cancel`] is
/// called every in-flight and future merge returns empty.
pub struct PartMerger {
    table: Arc<TableConfig>,
    parts: Arc<PartSet>,
    store: Arc<dyn PartStore>,
    selector: MergeSelector,
    cancelled: AtomicBool,
}

impl PartMerger {
    /// Create a merger over `parts`, reading and writing through `store`.
    pub fn new(table: Arc<TableConfig>, parts: Arc<PartSet>, store: Arc<dyn PartStore>) -> Self {
        Self {
            selector: MergeSelector::new(Arc::clone(&table)),
            table,
            parts,
            store,
            cancelled: AtomicBool::new(false),
        }
    }

    /// The part set this merger publishes into.
    pub fn part_set(&self) -> &Arc<PartSet> {
        &self.parts
    }

    /// Request cooperative cancellation; observed once per output block.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Select the next run to merge from a fresh snapshot of the part set.
    pub fn select_parts_to_merge(
        &self,
        available_disk_bytes: u64,
        flags: SelectorFlags,
        can_merge: &dyn Fn(&Part, &Part) -> bool,
    ) -> Option<Vec<PartRef>> {
        let snapshot = self.parts.snapshot();
        self.selector.select(
            &snapshot,
            available_disk_bytes,
            flags,
            can_merge,
            &MergeClock::local(),
        )
    }

    /// Bytes to reserve on disk before merging `run`.
    pub fn estimate_disk_space_for_merge(&self, run: &[PartRef]) -> u64 {
        space::estimate_disk_space_for_merge(run)
    }

    /// Merge a selected run into one new part and atomically swap it into
    /// the part set.
    ///
    /// Returns the new part's name, or `None` when the merge was cancelled
    /// or a collapsing/summing merge consumed every row; in both cases the
    /// part set is untouched and the partial output is discarded.
    pub async fn merge_parts(&self, run: &[PartRef]) -> Result<Option<String>, MergeError> {
        validate_run(run)?;
        let first = run.first().ok_or(MergeError::NoInputs)?;
        let last = run.last().ok_or(MergeError::NoInputs)?;
        grist_log!(
            Level::Debug,
            "merge_parts",
            "merging {} parts: from {} to {}",
            run.len(),
            first.name,
            last.name,
        );

        let output = merged_metadata(run);
        let columns = self.table.column_names();

        let mut sources: Vec<Box<dyn BlockSource>> = Vec::with_capacity(run.len());
        for part in run {
            let reader = self
                .store
                .reader(part, MarkRange::full(part), &columns)
                .await?;
            sources.push(match self.table.primary_expression() {
                Some(expression) => {
                    Box::new(ExpressionBlockSource::new(reader, Arc::clone(expression)))
                }
                None => reader,
            });
        }

        let mut merged = MergingStream::new(sources, &self.table, DEFAULT_MERGE_BLOCK_SIZE)?;
        let mut sink = self.store.writer(&output).await?;

        merged.read_prefix().await?;
        sink.write_prefix().await?;

        while !self.is_cancelled() {
            match merged.read().await? {
                Some(block) => sink.write(block).await?,
                None => break,
            }
        }

        if self.is_cancelled() {
            grist_log!(Level::Info, "merge_parts", "cancelled merging parts");
            return Ok(None);
        }

        merged.read_suffix().await?;
        sink.write_suffix().await?;

        let marks = sink.marks_count();
        if marks == 0 {
            if matches!(self.table.mode(), MergeMode::Ordinary) {
                return Err(MergeError::EmptyOrdinaryOutput);
            }
            grist_log!(
                Level::Info,
                "merge_parts",
                "all rows have been deleted while merging from {} to {}",
                first.name,
                last.name,
            );
            return Ok(None);
        }

        let part = Arc::new(
            output
                .with_size(marks)
                .with_size_in_bytes(sink.bytes_written())
                .with_modification_time(Utc::now().timestamp()),
        );

        // The freshly written index is re-read from the store before the
        // part becomes visible.
        let index = self.store.read_index(&part.name).await?;
        if index.len() as u64 != marks {
            return Err(MergeError::IndexMismatch {
                name: part.name.clone(),
                expected: marks,
                actual: index.len() as u64,
            });
        }

        self.parts.replace_parts(run, Arc::clone(&part))?;

        grist_log!(
            Level::Trace,
            "merge_parts",
            "merged {} parts: from {} to {}",
            run.len(),
            first.name,
            last.name,
        );
        Ok(Some(part.name.clone()))
    }
}

fn validate_run(run: &[PartRef]) -> Result<(), MergeError> {
    if run.is_empty() {
        return Err(MergeError::NoInputs);
    }
    for part in run {
        if part.spans_months() {
            return Err(MergeError::PartSpansMonths(part.name.clone()));
        }
    }
    for pair in run.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.left_month != next.left_month {
            return Err(MergeError::PartitionMismatch(
                prev.name.clone(),
                next.name.clone(),
            ));
        }
        if next.left < prev.right {
            return Err(MergeError::OverlappingRun(
                prev.name.clone(),
                next.name.clone(),
            ));
        }
    }
    Ok(())
}

fn merged_metadata(run: &[PartRef]) -> Part {
    let first = &run[0];
    let mut left_date = first.left_date;
    let mut right_date = first.right_date;
    let mut level = first.level;
    for part in &run[1..] {
        left_date = left_date.min(part.left_date);
        right_date = right_date.max(part.right_date);
        level = level.max(part.level);
    }
    Part::new(
        left_date,
        right_date,
        first.left,
        run[run.len() - 1].right,
        level + 1,
    )
}

#[cfg(test)]
mod tests {
    use arrow_array::{Int64Array, Int8Array, RecordBatch, UInt64Array};
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use chrono::NaiveDate;

    use super::*;
    use crate::{
        block::{value_at, Value},
        part::memory::MemoryPartStore,
        table::{BlockExpression, MergeMode},
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn value_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("v", DataType::Int64, false),
        ]))
    }

    fn value_block(schema: &SchemaRef, ids: &[u64], values: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            Arc::clone(schema),
            vec![
                Arc::new(UInt64Array::from(ids.to_vec())),
                Arc::new(Int64Array::from(values.to_vec())),
            ],
        )
        .unwrap()
    }

    fn ordinary_table() -> Arc<TableConfig> {
        Arc::new(TableConfig::new(value_schema(), vec!["id".into()]).unwrap())
    }

    /// Register a part whose data is `blocks`, on `day`, spanning ids
    /// `left..=right`.
    fn seed_part(
        store: &MemoryPartStore,
        day: NaiveDate,
        left: u64,
        right: u64,
        level: u32,
        blocks: Vec<RecordBatch>,
    ) -> PartRef {
        let part = Arc::new(
            Part::new(day, day, left, right, level)
                .with_size(blocks.len() as u64)
                .with_size_in_bytes(blocks.len() as u64 * 64)
                .with_modification_time(0),
        );
        store.insert_blocks(&part.name, blocks).unwrap();
        part
    }

    fn merger_over(
        table: Arc<TableConfig>,
        parts: Vec<PartRef>,
        store: Arc<MemoryPartStore>,
    ) -> PartMerger {
        PartMerger::new(table, Arc::new(PartSet::from_parts(parts)), store)
    }

    fn read_rows(store: &MemoryPartStore, name: &str) -> Vec<(u64, i64)> {
        let mut rows = Vec::new();
        for block in store.part_blocks(name).unwrap() {
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
        rows
    }

    #[tokio::test]
    async fn ordinary_merge_replaces_run_with_sorted_output() {
        let table = ordinary_table();
        let store = Arc::new(MemoryPartStore::new(Arc::clone(&table)));
        let schema = Arc::clone(table.schema());
        let day = date(2014, 6, 5);

        let a = seed_part(
            &store,
            day,
            1,
            2,
            0,
            vec![value_block(&schema, &[1, 4], &[10, 40])],
        );
        let b = seed_part(
            &store,
            date(2014, 6, 20),
            3,
            4,
            1,
            vec![value_block(&schema, &[2, 9], &[20, 90])],
        );
        let run = vec![Arc::clone(&a), Arc::clone(&b)];
        let merger = merger_over(Arc::clone(&table), run.clone(), Arc::clone(&store));

        let name = merger.merge_parts(&run).await.unwrap().unwrap();
        assert_eq!(name, "20140605_20140620_1_4_2");

        let snapshot = merger.part_set().snapshot();
        assert_eq!(snapshot.len(), 1);
        let merged = &snapshot[0];
        assert_eq!(merged.name, name);
        assert_eq!(merged.level, 2);
        assert_eq!(merged.left, 1);
        assert_eq!(merged.right, 4);
        assert_eq!(merged.left_date, date(2014, 6, 5));
        assert_eq!(merged.right_date, date(2014, 6, 20));
        assert_eq!(merged.size, 1);
        assert!(merged.modification_time > 0);

        assert_eq!(
            read_rows(&store, &name),
            vec![(1, 10), (2, 20), (4, 40), (9, 90)]
        );
    }

    #[tokio::test]
    async fn cancelled_merge_leaves_part_set_untouched() {
        let table = ordinary_table();
        let store = Arc::new(MemoryPartStore::new(Arc::clone(&table)));
        let schema = Arc::clone(table.schema());
        let day = date(2014, 6, 5);

        let a = seed_part(&store, day, 1, 1, 0, vec![value_block(&schema, &[1], &[10])]);
        let b = seed_part(&store, day, 2, 2, 0, vec![value_block(&schema, &[2], &[20])]);
        let run = vec![a, b];
        let merger = merger_over(Arc::clone(&table), run.clone(), Arc::clone(&store));

        merger.cancel();
        let result = merger.merge_parts(&run).await.unwrap();
        assert!(result.is_none());
        assert_eq!(merger.part_set().len(), 2);
    }

    #[tokio::test]
    async fn summing_merge_aggregates_key_groups() {
        let schema = value_schema();
        let table = Arc::new(
            TableConfig::new(Arc::clone(&schema), vec!["id".into()])
                .unwrap()
                .with_mode(MergeMode::Summing),
        );
        let store = Arc::new(MemoryPartStore::new(Arc::clone(&table)));
        let day = date(2014, 6, 5);

        let a = seed_part(
            &store,
            day,
            1,
            1,
            0,
            vec![value_block(&schema, &[1, 2], &[5, 1])],
        );
        let b = seed_part(
            &store,
            day,
            2,
            2,
            0,
            vec![value_block(&schema, &[1, 3], &[7, 2])],
        );
        let run = vec![a, b];
        let merger = merger_over(Arc::clone(&table), run.clone(), Arc::clone(&store));

        let name = merger.merge_parts(&run).await.unwrap().unwrap();
        assert_eq!(read_rows(&store, &name), vec![(1, 12), (2, 1), (3, 2)]);
    }

    #[tokio::test]
    async fn fully_collapsed_merge_publishes_nothing() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("sign", DataType::Int8, false),
        ]));
        let table = Arc::new(
            TableConfig::new(Arc::clone(&schema), vec!["id".into()])
                .unwrap()
                .with_mode(MergeMode::Collapsing)
                .with_sign_column("sign"),
        );
        let store = Arc::new(MemoryPartStore::new(Arc::clone(&table)));
        let day = date(2014, 6, 5);
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

        let a = seed_part(&store, day, 1, 1, 0, vec![signed(&[1], &[1])]);
        let b = seed_part(&store, day, 2, 2, 0, vec![signed(&[1], &[-1])]);
        let run = vec![a, b];
        let merger = merger_over(Arc::clone(&table), run.clone(), Arc::clone(&store));

        let result = merger.merge_parts(&run).await.unwrap();
        assert!(result.is_none());
        assert_eq!(merger.part_set().len(), 2);
    }

    #[tokio::test]
    async fn empty_ordinary_output_is_a_logic_error() {
        let table = ordinary_table();
        let store = Arc::new(MemoryPartStore::new(Arc::clone(&table)));
        let day = date(2014, 6, 5);

        let a = seed_part(&store, day, 1, 1, 0, vec![]);
        let b = seed_part(&store, day, 2, 2, 0, vec![]);
        let run = vec![a, b];
        let merger = merger_over(Arc::clone(&table), run.clone(), Arc::clone(&store));

        assert!(matches!(
            merger.merge_parts(&run).await,
            Err(MergeError::EmptyOrdinaryOutput)
        ));
    }

    #[tokio::test]
    async fn rejects_overlapping_run() {
        let table = ordinary_table();
        let store = Arc::new(MemoryPartStore::new(Arc::clone(&table)));
        let schema = Arc::clone(table.schema());
        let day = date(2014, 6, 5);

        let a = seed_part(&store, day, 1, 5, 0, vec![value_block(&schema, &[1], &[10])]);
        let b = seed_part(&store, day, 3, 8, 0, vec![value_block(&schema, &[2], &[20])]);
        let run = vec![a, b];
        let merger = merger_over(Arc::clone(&table), run.clone(), Arc::clone(&store));

        assert!(matches!(
            merger.merge_parts(&run).await,
            Err(MergeError::OverlappingRun(_, _))
        ));
    }

    #[tokio::test]
    async fn applies_primary_expression_to_inputs() {
        struct DoubleValues;

        impl BlockExpression for DoubleValues {
            fn evaluate(&self, block: RecordBatch) -> Result<RecordBatch, MergeError> {
                let values = block
                    .column(1)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap();
                let doubled: Int64Array = values.iter().map(|v| v.map(|v| v * 2)).collect();
                RecordBatch::try_new(
                    block.schema(),
                    vec![Arc::clone(block.column(0)), Arc::new(doubled)],
                )
                .map_err(MergeError::Arrow)
            }
        }

        let schema = value_schema();
        let table = Arc::new(
            TableConfig::new(Arc::clone(&schema), vec!["id".into()])
                .unwrap()
                .with_primary_expression(Arc::new(DoubleValues)),
        );
        let store = Arc::new(MemoryPartStore::new(Arc::clone(&table)));
        let day = date(2014, 6, 5);

        let a = seed_part(&store, day, 1, 1, 0, vec![value_block(&schema, &[1], &[10])]);
        let b = seed_part(&store, day, 2, 2, 0, vec![value_block(&schema, &[2], &[20])]);
        let run = vec![a, b];
        let merger = merger_over(Arc::clone(&table), run.clone(), Arc::clone(&store));

        let name = merger.merge_parts(&run).await.unwrap().unwrap();
        assert_eq!(read_rows(&store, &name), vec![(1, 20), (2, 40)]);
    }

    #[tokio::test]
    async fn estimates_reservation_from_input_bytes() {
        let table = ordinary_table();
        let store = Arc::new(MemoryPartStore::new(Arc::clone(&table)));
        let day = date(2014, 6, 5);
        let part = Arc::new(
            Part::new(day, day, 1, 1, 0)
                .with_size(1)
                .with_size_in_bytes(100),
        );
        let merger = merger_over(Arc::clone(&table), vec![Arc::clone(&part)], store);
        assert_eq!(merger.estimate_disk_space_for_merge(&[part]), 140);
    }
}
