//! In-memory part store: the embedded and test backend.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use arrow_array::RecordBatch;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    block::{sort_key_at, SortKey},
    error::MergeError,
    part::{
        store::{BlockSink, BlockSource, MarkRange, PartStore},
        Part,
    },
    table::TableConfig,
};

#[derive(Clone)]
struct StoredPart {
    blocks: Vec<RecordBatch>,
    index: Vec<SortKey>,
}

type Shared = Arc<RwLock<HashMap<String, StoredPart>>>;

/// Part store keeping every block in memory.
///
/// One block corresponds to one index mark; the sparse index holds the sort
/// key of each block's first row. Writers stage blocks privately and publish
/// them on `write_suffix`, so a dropped writer leaves no trace.
pub struct MemoryPartStore {
    table: Arc<TableConfig>,
    inner: Shared,
}

impl MemoryPartStore {
    /// Create an empty store for `table`.
    pub fn new(table: Arc<TableConfig>) -> Self {
        Self {
            table,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a part's blocks, deriving its index. Empty blocks are
    /// dropped; blocks must match the table schema.
    pub fn insert_blocks(&self, name: &str, blocks: Vec<RecordBatch>) -> Result<(), MergeError> {
        let mut kept = Vec::with_capacity(blocks.len());
        let mut index = Vec::with_capacity(blocks.len());
        for block in blocks {
            if block.schema() != *self.table.schema() {
                return Err(MergeError::SchemaMismatch);
            }
            if block.num_rows() == 0 {
                continue;
            }
            index.push(sort_key_at(&block, self.table.sort_indices(), 0)?);
            kept.push(block);
        }
        self.inner
            .write()
            .insert(name.to_owned(), StoredPart { blocks: kept, index });
        Ok(())
    }

    /// Blocks of a stored part, if present.
    pub fn part_blocks(&self, name: &str) -> Option<Vec<RecordBatch>> {
        self.inner.read().get(name).map(|part| part.blocks.clone())
    }

    /// Whether the store holds data for `name`.
    pub fn contains_part(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }
}

#[async_trait]
impl PartStore for MemoryPartStore {
    async fn reader(
        &self,
        part: &Part,
        range: MarkRange,
        columns: &[String],
    ) -> Result<Box<dyn BlockSource>, MergeError> {
        let stored = {
            let guard = self.inner.read();
            guard
                .get(&part.name)
                .cloned()
                .ok_or_else(|| MergeError::UnknownPart(part.name.clone()))?
        };

        let begin = (range.begin as usize).min(stored.blocks.len());
        let end = (range.end as usize).min(stored.blocks.len());
        let schema = self.table.schema();
        let projection = if columns == self.table.column_names() {
            None
        } else {
            Some(
                columns
                    .iter()
                    .map(|name| {
                        schema
                            .index_of(name)
                            .map_err(|_| MergeError::UnknownColumn(name.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )
        };

        Ok(Box::new(MemoryBlockSource {
            blocks: stored.blocks[begin..end].iter().cloned().collect(),
            projection,
        }))
    }

    async fn writer(&self, part: &Part) -> Result<Box<dyn BlockSink>, MergeError> {
        Ok(Box::new(MemoryBlockSink {
            name: part.name.clone(),
            table: Arc::clone(&self.table),
            inner: Arc::clone(&self.inner),
            blocks: Vec::new(),
            index: Vec::new(),
            bytes: 0,
        }))
    }

    async fn read_index(&self, name: &str) -> Result<Vec<SortKey>, MergeError> {
        self.inner
            .read()
            .get(name)
            .map(|part| part.index.clone())
            .ok_or_else(|| MergeError::UnknownPart(name.to_owned()))
    }
}

struct MemoryBlockSource {
    blocks: VecDeque<RecordBatch>,
    projection: Option<Vec<usize>>,
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn read(&mut self) -> Result<Option<RecordBatch>, MergeError> {
        let Some(block) = self.blocks.pop_front() else {
            return Ok(None);
        };
        match &self.projection {
            Some(indices) => Ok(Some(block.project(indices)?)),
            None => Ok(Some(block)),
        }
    }
}

struct MemoryBlockSink {
    name: String,
    table: Arc<TableConfig>,
    inner: Shared,
    blocks: Vec<RecordBatch>,
    index: Vec<SortKey>,
    bytes: u64,
}

#[async_trait]
impl BlockSink for MemoryBlockSink {
    async fn write(&mut self, block: RecordBatch) -> Result<(), MergeError> {
        if block.num_rows() == 0 {
            return Ok(());
        }
        self.index
            .push(sort_key_at(&block, self.table.sort_indices(), 0)?);
        self.bytes += block.get_array_memory_size() as u64;
        self.blocks.push(block);
        Ok(())
    }

    async fn write_suffix(&mut self) -> Result<(), MergeError> {
        self.inner.write().insert(
            self.name.clone(),
            StoredPart {
                blocks: std::mem::take(&mut self.blocks),
                index: std::mem::take(&mut self.index),
            },
        );
        Ok(())
    }

    fn marks_count(&self) -> u64 {
        self.index.len() as u64
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Int64Array, UInt64Array};
    use arrow_schema::{DataType, Field, Schema};
    use chrono::NaiveDate;

    use super::*;
    use crate::block::Value;

    fn table() -> Arc<TableConfig> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("v", DataType::Int64, false),
        ]));
        Arc::new(TableConfig::new(schema, vec!["id".into()]).unwrap())
    }

    fn block(table: &TableConfig, ids: &[u64], values: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            Arc::clone(table.schema()),
            vec![
                Arc::new(UInt64Array::from(ids.to_vec())),
                Arc::new(Int64Array::from(values.to_vec())),
            ],
        )
        .unwrap()
    }

    fn part(name_left: u64) -> Part {
        let day = NaiveDate::from_ymd_opt(2014, 6, 1).unwrap();
        Part::new(day, day, name_left, name_left, 0).with_size(2)
    }

    #[tokio::test]
    async fn reader_honors_mark_range_and_projection() {
        let table = table();
        let store = MemoryPartStore::new(Arc::clone(&table));
        let part = part(1);
        store
            .insert_blocks(
                &part.name,
                vec![
                    block(&table, &[1, 2], &[10, 20]),
                    block(&table, &[3, 4], &[30, 40]),
                ],
            )
            .unwrap();

        let mut source = store
            .reader(&part, MarkRange { begin: 1, end: 2 }, &["id".into()])
            .await
            .unwrap();
        let read = source.read().await.unwrap().unwrap();
        assert_eq!(read.num_columns(), 1);
        assert_eq!(read.num_rows(), 2);
        assert!(source.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sink_publishes_only_on_suffix() {
        let table = table();
        let store = MemoryPartStore::new(Arc::clone(&table));
        let part = part(7);

        let mut sink = store.writer(&part).await.unwrap();
        sink.write(block(&table, &[1, 2], &[10, 20])).await.unwrap();
        assert_eq!(sink.marks_count(), 1);
        assert!(!store.contains_part(&part.name));
        drop(sink);
        assert!(!store.contains_part(&part.name));

        let mut sink = store.writer(&part).await.unwrap();
        sink.write(block(&table, &[1, 2], &[10, 20])).await.unwrap();
        sink.write_suffix().await.unwrap();
        assert!(store.contains_part(&part.name));
        let index = store.read_index(&part.name).await.unwrap();
        assert_eq!(index, vec![vec![Value::UInt64(1)]]);
    }
}
