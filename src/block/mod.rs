//! Dynamic cell values and block assembly for the merge path.
//!
//! The merge combiners work row-wise while blocks stay columnar. This module
//! bridges the two: [`value_at`] lifts one cell out of an Arrow column,
//! [`sort_key_at`] lifts the sort-column tuple for a row, and
//! [`BlockBuilder`] rebuilds combined rows into record batches.

use std::{cmp::Ordering, sync::Arc};

use arrow_array::{
    builder::{
        BooleanBuilder, Date32Builder, Float32Builder, Float64Builder, Int16Builder, Int32Builder,
        Int64Builder, Int8Builder, StringBuilder, UInt16Builder, UInt32Builder, UInt64Builder,
        UInt8Builder,
    },
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, RecordBatch, StringArray, UInt16Array, UInt32Array,
    UInt64Array, UInt8Array,
};
use arrow_schema::{DataType, SchemaRef};

use crate::error::MergeError;

/// A single dynamically typed cell extracted from a block column.
#[derive(Clone, Debug)]
pub enum Value {
    /// Absent cell.
    Null,
    /// Boolean cell.
    Bool(bool),
    /// Signed 8-bit integer cell.
    Int8(i8),
    /// Signed 16-bit integer cell.
    Int16(i16),
    /// Signed 32-bit integer cell.
    Int32(i32),
    /// Signed 64-bit integer cell.
    Int64(i64),
    /// Unsigned 8-bit integer cell.
    UInt8(u8),
    /// Unsigned 16-bit integer cell.
    UInt16(u16),
    /// Unsigned 32-bit integer cell.
    UInt32(u32),
    /// Unsigned 64-bit integer cell.
    UInt64(u64),
    /// 32-bit float cell; ordered by total order.
    Float32(f32),
    /// 64-bit float cell; ordered by total order.
    Float64(f64),
    /// Days-since-epoch date cell.
    Date32(i32),
    /// UTF-8 string cell.
    Utf8(String),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int8(_) => 2,
            Value::Int16(_) => 3,
            Value::Int32(_) => 4,
            Value::Int64(_) => 5,
            Value::UInt8(_) => 6,
            Value::UInt16(_) => 7,
            Value::UInt32(_) => 8,
            Value::UInt64(_) => 9,
            Value::Float32(_) => 10,
            Value::Float64(_) => 11,
            Value::Date32(_) => 12,
            Value::Utf8(_) => 13,
        }
    }

    /// Widen an integer cell to `i64`, e.g. to read a collapsing sign.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(i64::from(*v)),
            Value::Int16(v) => Some(i64::from(*v)),
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::UInt8(v) => Some(i64::from(*v)),
            Value::UInt16(v) => Some(i64::from(*v)),
            Value::UInt32(v) => Some(i64::from(*v)),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Accumulate `other` into `self` for summing merges. A null on either
    /// side leaves the non-null operand; integers wrap on overflow.
    pub(crate) fn add_assign(&mut self, other: &Value) -> Result<(), MergeError> {
        match (self, other) {
            (_, Value::Null) => Ok(()),
            (slot @ Value::Null, value) => {
                *slot = value.clone();
                Ok(())
            }
            (Value::Int8(a), Value::Int8(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (Value::Int16(a), Value::Int16(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (Value::Int32(a), Value::Int32(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (Value::Int64(a), Value::Int64(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (Value::UInt8(a), Value::UInt8(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (Value::UInt16(a), Value::UInt16(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (Value::UInt32(a), Value::UInt32(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (Value::UInt64(a), Value::UInt64(b)) => {
                *a = a.wrapping_add(*b);
                Ok(())
            }
            (Value::Float32(a), Value::Float32(b)) => {
                *a += *b;
                Ok(())
            }
            (Value::Float64(a), Value::Float64(b)) => {
                *a += *b;
                Ok(())
            }
            _ => Err(MergeError::CellTypeMismatch),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int8(a), Value::Int8(b)) => a.cmp(b),
            (Value::Int16(a), Value::Int16(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::UInt8(a), Value::UInt8(b)) => a.cmp(b),
            (Value::UInt16(a), Value::UInt16(b)) => a.cmp(b),
            (Value::UInt32(a), Value::UInt32(b)) => a.cmp(b),
            (Value::UInt64(a), Value::UInt64(b)) => a.cmp(b),
            (Value::Float32(a), Value::Float32(b)) => a.total_cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Date32(a), Value::Date32(b)) => a.cmp(b),
            (Value::Utf8(a), Value::Utf8(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Tuple of sort-column cells positioning a row in the table order.
pub type SortKey = Vec<Value>;

/// Whether a column of this type participates in summing merges.
pub(crate) fn is_summable(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

fn downcast<'a, T: 'static>(array: &'a dyn Array) -> Result<&'a T, MergeError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| MergeError::UnsupportedType(array.data_type().clone()))
}

/// Read one cell out of a column.
pub fn value_at(array: &dyn Array, row: usize) -> Result<Value, MergeError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Boolean => Value::Bool(downcast::<BooleanArray>(array)?.value(row)),
        DataType::Int8 => Value::Int8(downcast::<Int8Array>(array)?.value(row)),
        DataType::Int16 => Value::Int16(downcast::<Int16Array>(array)?.value(row)),
        DataType::Int32 => Value::Int32(downcast::<Int32Array>(array)?.value(row)),
        DataType::Int64 => Value::Int64(downcast::<Int64Array>(array)?.value(row)),
        DataType::UInt8 => Value::UInt8(downcast::<UInt8Array>(array)?.value(row)),
        DataType::UInt16 => Value::UInt16(downcast::<UInt16Array>(array)?.value(row)),
        DataType::UInt32 => Value::UInt32(downcast::<UInt32Array>(array)?.value(row)),
        DataType::UInt64 => Value::UInt64(downcast::<UInt64Array>(array)?.value(row)),
        DataType::Float32 => Value::Float32(downcast::<Float32Array>(array)?.value(row)),
        DataType::Float64 => Value::Float64(downcast::<Float64Array>(array)?.value(row)),
        DataType::Date32 => Value::Date32(downcast::<Date32Array>(array)?.value(row)),
        DataType::Utf8 => Value::Utf8(downcast::<StringArray>(array)?.value(row).to_owned()),
        other => return Err(MergeError::UnsupportedType(other.clone())),
    };
    Ok(value)
}

/// Extract the sort-column tuple of `row` given resolved column indices.
pub fn sort_key_at(
    batch: &RecordBatch,
    sort_indices: &[usize],
    row: usize,
) -> Result<SortKey, MergeError> {
    sort_indices
        .iter()
        .map(|index| value_at(batch.column(*index).as_ref(), row))
        .collect()
}

/// Extract every cell of `row`.
pub(crate) fn row_at(batch: &RecordBatch, row: usize) -> Result<Vec<Value>, MergeError> {
    batch
        .columns()
        .iter()
        .map(|column| value_at(column.as_ref(), row))
        .collect()
}

enum ColumnBuilder {
    Bool(BooleanBuilder),
    Int8(Int8Builder),
    Int16(Int16Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    UInt8(UInt8Builder),
    UInt16(UInt16Builder),
    UInt32(UInt32Builder),
    UInt64(UInt64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Date32(Date32Builder),
    Utf8(StringBuilder),
}

impl ColumnBuilder {
    fn for_type(data_type: &DataType) -> Result<Self, MergeError> {
        let builder = match data_type {
            DataType::Boolean => ColumnBuilder::Bool(BooleanBuilder::new()),
            DataType::Int8 => ColumnBuilder::Int8(Int8Builder::new()),
            DataType::Int16 => ColumnBuilder::Int16(Int16Builder::new()),
            DataType::Int32 => ColumnBuilder::Int32(Int32Builder::new()),
            DataType::Int64 => ColumnBuilder::Int64(Int64Builder::new()),
            DataType::UInt8 => ColumnBuilder::UInt8(UInt8Builder::new()),
            DataType::UInt16 => ColumnBuilder::UInt16(UInt16Builder::new()),
            DataType::UInt32 => ColumnBuilder::UInt32(UInt32Builder::new()),
            DataType::UInt64 => ColumnBuilder::UInt64(UInt64Builder::new()),
            DataType::Float32 => ColumnBuilder::Float32(Float32Builder::new()),
            DataType::Float64 => ColumnBuilder::Float64(Float64Builder::new()),
            DataType::Date32 => ColumnBuilder::Date32(Date32Builder::new()),
            DataType::Utf8 => ColumnBuilder::Utf8(StringBuilder::new()),
            other => return Err(MergeError::UnsupportedType(other.clone())),
        };
        Ok(builder)
    }

    fn append(&mut self, value: &Value) -> Result<(), MergeError> {
        if matches!(value, Value::Null) {
            self.append_null();
            return Ok(());
        }
        match (self, value) {
            (ColumnBuilder::Bool(b), Value::Bool(v)) => b.append_value(*v),
            (ColumnBuilder::Int8(b), Value::Int8(v)) => b.append_value(*v),
            (ColumnBuilder::Int16(b), Value::Int16(v)) => b.append_value(*v),
            (ColumnBuilder::Int32(b), Value::Int32(v)) => b.append_value(*v),
            (ColumnBuilder::Int64(b), Value::Int64(v)) => b.append_value(*v),
            (ColumnBuilder::UInt8(b), Value::UInt8(v)) => b.append_value(*v),
            (ColumnBuilder::UInt16(b), Value::UInt16(v)) => b.append_value(*v),
            (ColumnBuilder::UInt32(b), Value::UInt32(v)) => b.append_value(*v),
            (ColumnBuilder::UInt64(b), Value::UInt64(v)) => b.append_value(*v),
            (ColumnBuilder::Float32(b), Value::Float32(v)) => b.append_value(*v),
            (ColumnBuilder::Float64(b), Value::Float64(v)) => b.append_value(*v),
            (ColumnBuilder::Date32(b), Value::Date32(v)) => b.append_value(*v),
            (ColumnBuilder::Utf8(b), Value::Utf8(v)) => b.append_value(v),
            _ => return Err(MergeError::CellTypeMismatch),
        }
        Ok(())
    }

    fn append_null(&mut self) {
        match self {
            ColumnBuilder::Bool(b) => b.append_null(),
            ColumnBuilder::Int8(b) => b.append_null(),
            ColumnBuilder::Int16(b) => b.append_null(),
            ColumnBuilder::Int32(b) => b.append_null(),
            ColumnBuilder::Int64(b) => b.append_null(),
            ColumnBuilder::UInt8(b) => b.append_null(),
            ColumnBuilder::UInt16(b) => b.append_null(),
            ColumnBuilder::UInt32(b) => b.append_null(),
            ColumnBuilder::UInt64(b) => b.append_null(),
            ColumnBuilder::Float32(b) => b.append_null(),
            ColumnBuilder::Float64(b) => b.append_null(),
            ColumnBuilder::Date32(b) => b.append_null(),
            ColumnBuilder::Utf8(b) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Bool(b) => Arc::new(b.finish()),
            ColumnBuilder::Int8(b) => Arc::new(b.finish()),
            ColumnBuilder::Int16(b) => Arc::new(b.finish()),
            ColumnBuilder::Int32(b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt8(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt16(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt32(b) => Arc::new(b.finish()),
            ColumnBuilder::UInt64(b) => Arc::new(b.finish()),
            ColumnBuilder::Float32(b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(b) => Arc::new(b.finish()),
            ColumnBuilder::Date32(b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(b) => Arc::new(b.finish()),
        }
    }
}

/// Columnar builder assembling merged rows back into record batches.
pub struct BlockBuilder {
    schema: SchemaRef,
    builders: Vec<ColumnBuilder>,
    rows: usize,
}

impl BlockBuilder {
    /// Create a builder for `schema`; fails on column types the merge path
    /// cannot rebuild.
    pub fn new(schema: SchemaRef) -> Result<Self, MergeError> {
        let builders = schema
            .fields()
            .iter()
            .map(|field| ColumnBuilder::for_type(field.data_type()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema,
            builders,
            rows: 0,
        })
    }

    /// Append one row of cells, one per schema column.
    pub fn append_row(&mut self, row: &[Value]) -> Result<(), MergeError> {
        if row.len() != self.builders.len() {
            return Err(MergeError::SchemaMismatch);
        }
        for (builder, value) in self.builders.iter_mut().zip(row) {
            builder.append(value)?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Rows buffered since the last [`BlockBuilder::finish`].
    pub fn len(&self) -> usize {
        self.rows
    }

    /// Whether no rows are buffered.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Assemble the buffered rows into a block and reset the builder.
    pub fn finish(&mut self) -> Result<RecordBatch, MergeError> {
        let columns: Vec<ArrayRef> = self
            .builders
            .iter_mut()
            .map(ColumnBuilder::finish)
            .collect();
        self.rows = 0;
        RecordBatch::try_new(Arc::clone(&self.schema), columns).map_err(MergeError::Arrow)
    }
}
