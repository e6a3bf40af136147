//! Named structures held by a `Storage`.
//!
//! Every structure guards its contents with its own lock and bumps a
//! version counter on each mutation, which is how `flush_data` finds the
//! structures that changed since the last checkpoint.

use crate::traits::{Data, EngineError, EngineResult};
use partflow_common::CommonError;
use partflow_common::error::context::ErrorContext;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn encode_bincode<V: Serialize + ?Sized>(value: &V) -> EngineResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
        CommonError::serialization_error(format!("bincode encode failed: {}", e)).into()
    })
}

pub(crate) fn decode_bincode<V: DeserializeOwned>(bytes: &[u8]) -> EngineResult<V> {
    bincode::serde::decode_from_slice::<V, _>(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| CommonError::deserialization_error(format!("bincode decode failed: {}", e)).into())
}

/// Type-erased view the owning `Storage` uses for flushing.
pub(crate) trait Structure: Send + Sync {
    fn version(&self) -> u64;

    fn encode(&self) -> EngineResult<Vec<u8>>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Guarded<V> {
    value: RwLock<V>,
    version: AtomicU64,
}

impl<V> Guarded<V> {
    fn new(value: V) -> Self {
        Self {
            value: RwLock::new(value),
            version: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, V> {
        self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The version is bumped while the lock is held, so a reader that sees
    /// the new version also sees the new contents.
    fn write(&self) -> RwLockWriteGuard<'_, V> {
        let guard = self.value.write().unwrap_or_else(PoisonError::into_inner);
        self.version.fetch_add(1, Ordering::AcqRel);
        guard
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

fn out_of_bounds(what: &str, index: usize, len: usize) -> EngineError {
    EngineError::invalid_argument(format!("{} index {} out of bounds (len {})", what, index, len))
}

/// Dense array indexed `0..len`.
pub struct Array<T> {
    name: String,
    items: Guarded<Vec<T>>,
}

impl<T> std::fmt::Debug for Array<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array").field("name", &self.name).finish()
    }
}

impl<T: Data> Array<T> {
    pub(crate) fn new(name: &str, items: Vec<T>) -> Self {
        Self {
            name: name.to_string(),
            items: Guarded::new(items),
        }
    }

    pub(crate) fn decode(name: &str, bytes: &[u8]) -> EngineResult<Self> {
        Ok(Self::new(name, decode_bincode(bytes)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.items.read().get(index).cloned()
    }

    pub fn set(&self, index: usize, value: T) -> EngineResult<()> {
        let len = self.len();
        if index >= len {
            return Err(out_of_bounds("array", index, len));
        }
        let mut items = self.items.write();
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(out_of_bounds("array", index, items.len())),
        }
    }

    pub fn push(&self, value: T) {
        self.items.write().push(value);
    }

    pub fn extend(&self, values: impl IntoIterator<Item = T>) {
        self.items.write().extend(values);
    }

    /// Grow or shrink to `len`, filling new slots with `value`.
    pub fn resize(&self, len: usize, value: T) {
        self.items.write().resize(len, value);
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.read().clone()
    }

    /// Elements in `start..end`.
    pub fn range(&self, start: usize, end: usize) -> EngineResult<Vec<T>> {
        let items = self.items.read();
        if start > end || end > items.len() {
            return Err(EngineError::invalid_argument(format!(
                "range {}..{} out of bounds (len {})",
                start,
                end,
                items.len()
            )));
        }
        Ok(items[start..end].to_vec())
    }
}

impl<T: Data> Structure for Array<T> {
    fn version(&self) -> u64 {
        self.items.version()
    }

    fn encode(&self) -> EngineResult<Vec<u8>> {
        encode_bincode(&*self.items.read())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Dense row-major matrix whose dimensions are fixed at creation.
pub struct Matrix<T> {
    name: String,
    rows: usize,
    cols: usize,
    cells: Guarded<Vec<T>>,
}

impl<T> std::fmt::Debug for Matrix<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix")
            .field("name", &self.name)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

impl<T: Data> Matrix<T> {
    pub(crate) fn new(name: &str, rows: usize, cols: usize) -> EngineResult<Self>
    where
        T: Default,
    {
        let len = rows.checked_mul(cols).ok_or_else(|| {
            EngineError::invalid_argument(format!(
                "matrix {} of {}x{} cells is too large",
                name, rows, cols
            ))
        })?;
        Ok(Self {
            name: name.to_string(),
            rows,
            cols,
            cells: Guarded::new(vec![T::default(); len]),
        })
    }

    pub(crate) fn decode(name: &str, bytes: &[u8]) -> EngineResult<Self> {
        let (rows, cols, cells): (usize, usize, Vec<T>) = decode_bincode(bytes)?;
        if rows.checked_mul(cols) != Some(cells.len()) {
            return Err(CommonError::deserialization_error(format!(
                "matrix {} holds {} cells for {}x{}",
                name,
                cells.len(),
                rows,
                cols
            ))
            .into());
        }
        Ok(Self {
            name: name.to_string(),
            rows,
            cols,
            cells: Guarded::new(cells),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn offset(&self, row: usize, col: usize) -> Option<usize> {
        (row < self.rows && col < self.cols).then(|| row * self.cols + col)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        let offset = self.offset(row, col)?;
        self.cells.read().get(offset).cloned()
    }

    pub fn set(&self, row: usize, col: usize, value: T) -> EngineResult<()> {
        let offset = self.offset(row, col).ok_or_else(|| {
            EngineError::invalid_argument(format!(
                "cell ({}, {}) outside {}x{} matrix {}",
                row, col, self.rows, self.cols, self.name
            ))
        })?;
        self.cells.write()[offset] = value;
        Ok(())
    }

    pub fn row(&self, row: usize) -> Option<Vec<T>> {
        if row >= self.rows {
            return None;
        }
        let start = row * self.cols;
        Some(self.cells.read()[start..start + self.cols].to_vec())
    }

    pub fn to_rows(&self) -> Vec<Vec<T>> {
        if self.cols == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.cells
            .read()
            .chunks(self.cols)
            .map(<[T]>::to_vec)
            .collect()
    }
}

impl<T: Data> Structure for Matrix<T> {
    fn version(&self) -> u64 {
        self.cells.version()
    }

    fn encode(&self) -> EngineResult<Vec<u8>> {
        let cells = self.cells.read();
        encode_bincode(&(self.rows, self.cols, cells.as_slice()))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// String-keyed dictionary with heterogeneous values.
///
/// Values are kept as JSON documents and converted on access.
pub struct Dictionary {
    name: String,
    entries: Guarded<BTreeMap<String, serde_json::Value>>,
}

impl Dictionary {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Guarded::new(BTreeMap::new()),
        }
    }

    pub(crate) fn decode(name: &str, bytes: &[u8]) -> EngineResult<Self> {
        let entries = serde_json::from_slice(bytes)
            .with_deserialization_context(|| format!("dictionary {}", name))?;
        Ok(Self {
            name: name.to_string(),
            entries: Guarded::new(entries),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace the value under `key`.
    pub fn put<V: Serialize + ?Sized>(&self, key: impl Into<String>, value: &V) -> EngineResult<()> {
        let key = key.into();
        let json = serde_json::to_value(value)
            .with_serialization_context(|| format!("dictionary {} key {}", self.name, key))?;
        self.entries.write().insert(key, json);
        Ok(())
    }

    /// Value under `key` converted to `V`; `Ok(None)` when the key is absent.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<V>> {
        let Some(json) = self.entries.read().get(key).cloned() else {
            return Ok(None);
        };
        let value = serde_json::from_value(json)
            .with_deserialization_context(|| format!("dictionary {} key {}", self.name, key))?;
        Ok(Some(value))
    }

    pub fn remove(&self, key: &str) -> bool {
        if !self.contains_key(key) {
            return false;
        }
        self.entries.write().remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Structure for Dictionary {
    fn version(&self) -> u64 {
        self.entries.version()
    }

    fn encode(&self) -> EngineResult<Vec<u8>> {
        let bytes = serde_json::to_vec(&*self.entries.read())
            .with_serialization_context(|| format!("dictionary {}", self.name))?;
        Ok(bytes)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Append-only sequence of records.
pub struct DataStream {
    name: String,
    records: Guarded<Vec<Vec<u8>>>,
}

impl DataStream {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Guarded::new(Vec::new()),
        }
    }

    pub(crate) fn decode(name: &str, bytes: &[u8]) -> EngineResult<Self> {
        Ok(Self {
            name: name.to_string(),
            records: Guarded::new(decode_bincode(bytes)?),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn append(&self, record: impl Into<Vec<u8>>) {
        self.records.write().push(record.into());
    }

    /// Append `value` encoded with bincode.
    pub fn append_value<V: Serialize + ?Sized>(&self, value: &V) -> EngineResult<()> {
        let record = encode_bincode(value)?;
        self.append(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn records(&self) -> Vec<Vec<u8>> {
        self.records.read().clone()
    }

    /// Decode every record written with `append_value`, in append order.
    pub fn read_values<V: DeserializeOwned>(&self) -> EngineResult<Vec<V>> {
        self.records
            .read()
            .iter()
            .map(|record| decode_bincode(record))
            .collect()
    }
}

impl Structure for DataStream {
    fn version(&self) -> u64 {
        self.records.version()
    }

    fn encode(&self) -> EngineResult<Vec<u8>> {
        encode_bincode(&*self.records.read())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ErrorKind;

    #[test]
    fn test_array_operations() {
        let array = Array::new("a", vec![1, 2, 3]);
        array.push(4);
        array.extend([5, 6]);
        array.set(0, 10).unwrap();

        assert_eq!(array.len(), 6);
        assert_eq!(array.get(0), Some(10));
        assert_eq!(array.get(6), None);
        assert_eq!(array.range(1, 3).unwrap(), vec![2, 3]);
        assert_eq!(array.set(9, 0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert!(array.range(4, 8).is_err());

        array.resize(2, 0);
        assert_eq!(array.to_vec(), vec![10, 2]);
    }

    #[test]
    fn test_mutations_bump_version() {
        let array = Array::new("a", Vec::<u8>::new());
        let before = array.version();
        array.push(1);
        assert!(array.version() > before);

        let stable = array.version();
        let _ = array.to_vec();
        assert_eq!(array.version(), stable);
    }

    #[test]
    fn test_matrix_cells_and_rows() {
        let matrix = Matrix::<i64>::new("m", 2, 3).unwrap();
        matrix.set(1, 2, 7).unwrap();

        assert_eq!(matrix.dimensions(), (2, 3));
        assert_eq!(matrix.get(1, 2), Some(7));
        assert_eq!(matrix.get(2, 0), None);
        assert_eq!(matrix.row(1), Some(vec![0, 0, 7]));
        assert_eq!(matrix.to_rows(), vec![vec![0, 0, 0], vec![0, 0, 7]]);
        assert!(matrix.set(0, 3, 1).is_err());

        let decoded = Matrix::<i64>::decode("m", &matrix.encode().unwrap()).unwrap();
        assert_eq!(decoded.to_rows(), matrix.to_rows());
    }

    #[test]
    fn test_matrix_cell_count_overflow() {
        let err = Matrix::<u8>::new("huge", 1 << 33, 1 << 31).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let bytes = encode_bincode(&(usize::MAX, 2usize, Vec::<u8>::new())).unwrap();
        assert!(Matrix::<u8>::decode("corrupt", &bytes).is_err());
    }

    #[test]
    fn test_dictionary_heterogeneous_values() {
        let dict = Dictionary::new("d");
        dict.put("count", &3u32).unwrap();
        dict.put("label", "words").unwrap();
        dict.put("weights", &vec![0.5, 1.5]).unwrap();

        assert_eq!(dict.get::<u32>("count").unwrap(), Some(3));
        assert_eq!(dict.get::<String>("label").unwrap().as_deref(), Some("words"));
        assert_eq!(dict.get::<Vec<f64>>("weights").unwrap(), Some(vec![0.5, 1.5]));
        assert_eq!(dict.get::<u32>("missing").unwrap(), None);
        assert_eq!(
            dict.get::<u32>("label").unwrap_err().kind(),
            ErrorKind::Storage
        );

        assert_eq!(dict.keys(), vec!["count", "label", "weights"]);
        assert!(dict.remove("count"));
        assert!(!dict.remove("count"));
    }

    #[test]
    fn test_data_stream_records() {
        let stream = DataStream::new("s");
        stream.append(b"raw".to_vec());
        stream.append_value(&("k".to_string(), 1u64)).unwrap();

        assert_eq!(stream.len(), 2);
        assert_eq!(stream.records()[0], b"raw".to_vec());

        let typed = DataStream::new("t");
        typed.append_value(&vec![1, 2]).unwrap();
        typed.append_value(&vec![3]).unwrap();
        assert_eq!(
            typed.read_values::<Vec<i32>>().unwrap(),
            vec![vec![1, 2], vec![3]]
        );
    }
}
