//! Named structures with a durable checkpoint.
//!
//! A `Storage` holds four independent namespaces (arrays, matrices,
//! dictionaries and data streams). Structures live in memory and are
//! written to the backing `BlobStore` only by `flush_data`, together with a
//! manifest that lets `StorageManager::open_storage` reload them later.

pub mod manager;
pub mod structures;

pub use manager::StorageManager;
pub use structures::{Array, DataStream, Dictionary, Matrix};

use crate::traits::{Data, EngineError, EngineResult};
use partflow_common::error::context::ErrorContext;
use partflow_common::{BatchOperation, BlobStore, CommonError};
use serde::{Deserialize, Serialize};
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use structures::Structure;
use tracing::{debug, info};

/// The four structure namespaces of a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Array,
    Matrix,
    Dictionary,
    DataStream,
}

impl Kind {
    const ALL: [Kind; 4] = [Kind::Array, Kind::Matrix, Kind::Dictionary, Kind::DataStream];

    fn as_str(&self) -> &'static str {
        match self {
            Kind::Array => "array",
            Kind::Matrix => "matrix",
            Kind::Dictionary => "dictionary",
            Kind::DataStream => "stream",
        }
    }
}

const DICTIONARY_ELEMENT: &str = "json";
const STREAM_ELEMENT: &str = "bytes";

enum Slot {
    Live(Arc<dyn Structure>),
    /// Loaded from the backend and not decoded yet.
    Encoded(Arc<Vec<u8>>),
}

struct Entry {
    slot: Slot,
    element_type: String,
    dims: Option<(usize, usize)>,
    flushed_version: Option<u64>,
}

impl Entry {
    fn live(structure: Arc<dyn Structure>, element_type: &str, dims: Option<(usize, usize)>) -> Self {
        Self {
            slot: Slot::Live(structure),
            element_type: element_type.to_string(),
            dims,
            flushed_version: None,
        }
    }

    fn is_dirty(&self) -> bool {
        match &self.slot {
            Slot::Live(structure) => self.flushed_version != Some(structure.version()),
            Slot::Encoded(_) => false,
        }
    }
}

type Namespace = RwLock<HashMap<String, Entry>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    kind: Kind,
    name: String,
    element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dims: Option<(usize, usize)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    storage: String,
    structures: Vec<ManifestEntry>,
}

/// A structure that changed since the last checkpoint.
struct DirtyStructure {
    kind: Kind,
    name: String,
    structure: Arc<dyn Structure>,
    version: u64,
    bytes: Vec<u8>,
}

fn downcast<S: Any + Send + Sync>(structure: &Arc<dyn Structure>, name: &str) -> EngineResult<Arc<S>> {
    Arc::clone(structure)
        .into_any()
        .downcast::<S>()
        .map_err(|_| EngineError::illegal_state(format!("structure {} has an unexpected layout", name)))
}

/// Named container of arrays, matrices, dictionaries and data streams.
pub struct Storage {
    name: String,
    blobs: Arc<dyn BlobStore>,
    arrays: Namespace,
    matrices: Namespace,
    dictionaries: Namespace,
    streams: Namespace,
    pending_deletes: Mutex<Vec<Vec<u8>>>,
    /// Blobs of a removed storage with the same name are still on the backend.
    replaces_removed: AtomicBool,
    manifest_dirty: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.name)
            .field("arrays", &self.array_names())
            .field("matrices", &self.matrix_names())
            .field("dictionaries", &self.dictionary_names())
            .field("data_streams", &self.data_stream_names())
            .finish()
    }
}

impl Storage {
    pub(crate) fn new(name: &str, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            name: name.to_string(),
            blobs,
            arrays: RwLock::default(),
            matrices: RwLock::default(),
            dictionaries: RwLock::default(),
            streams: RwLock::default(),
            pending_deletes: Mutex::new(Vec::new()),
            replaces_removed: AtomicBool::new(false),
            manifest_dirty: AtomicBool::new(true),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A fresh storage taking the name of a removed one. Its first flush
    /// deletes whatever the removed storage left on the backend.
    pub(crate) fn replacing(name: &str, blobs: Arc<dyn BlobStore>) -> Self {
        let storage = Self::new(name, blobs);
        storage.replaces_removed.store(true, Ordering::Release);
        storage
    }

    pub(crate) fn key_prefix(storage: &str) -> Vec<u8> {
        format!("{}/", storage).into_bytes()
    }

    pub(crate) fn manifest_key(storage: &str) -> Vec<u8> {
        format!("{}/manifest", storage).into_bytes()
    }

    fn structure_key(&self, kind: Kind, name: &str) -> Vec<u8> {
        format!("{}/{}/{}", self.name, kind.as_str(), name).into_bytes()
    }

    /// Reload a storage from its last flushed manifest.
    pub(crate) async fn open(name: &str, blobs: Arc<dyn BlobStore>) -> EngineResult<Self> {
        let manifest_bytes = blobs.get(&Self::manifest_key(name)).await?.ok_or_else(|| {
            EngineError::invalid_argument(format!("storage {} has never been flushed", name))
        })?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .with_deserialization_context(|| format!("manifest of storage {}", name))?;

        let storage = Self::new(name, blobs);
        for item in manifest.structures {
            let key = storage.structure_key(item.kind, &item.name);
            let bytes = storage.blobs.get(&key).await?.ok_or_else(|| {
                CommonError::not_found_error(format!(
                    "{} {} listed in manifest of storage {} is missing",
                    item.kind.as_str(),
                    item.name,
                    name
                ))
            })?;
            let entry = Entry {
                slot: Slot::Encoded(Arc::new(bytes)),
                element_type: item.element_type,
                dims: item.dims,
                flushed_version: None,
            };
            storage
                .namespace(item.kind)
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(item.name, entry);
        }
        storage.manifest_dirty.store(false, Ordering::Release);
        debug!("Opened storage {}", name);
        Ok(storage)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self, kind: Kind) -> &Namespace {
        match kind {
            Kind::Array => &self.arrays,
            Kind::Matrix => &self.matrices,
            Kind::Dictionary => &self.dictionaries,
            Kind::DataStream => &self.streams,
        }
    }

    fn names(&self, kind: Kind) -> Vec<String> {
        let mut names: Vec<String> = self
            .namespace(kind)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn contains(&self, kind: Kind, name: &str) -> bool {
        self.namespace(kind)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn remove(&self, kind: Kind, name: &str) -> bool {
        let removed = self
            .namespace(kind)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            self.pending_deletes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.structure_key(kind, name));
            self.manifest_dirty.store(true, Ordering::Release);
            debug!("Removed {} {} from storage {}", kind.as_str(), name, self.name);
        }
        removed
    }

    fn check_element_type(&self, kind: Kind, name: &str, entry: &Entry, expected: &str) -> EngineResult<()> {
        if entry.element_type == expected {
            Ok(())
        } else {
            Err(EngineError::invalid_argument(format!(
                "{} {} in storage {} holds {}, requested {}",
                kind.as_str(),
                name,
                self.name,
                entry.element_type,
                expected
            )))
        }
    }

    /// Typed handle for an entry, decoding it first if it was reloaded.
    fn resolve<S, D>(entry: &mut Entry, name: &str, decode: D) -> EngineResult<Arc<S>>
    where
        S: Structure + 'static,
        D: FnOnce(&str, &[u8]) -> EngineResult<S>,
    {
        let structure = match &entry.slot {
            Slot::Live(structure) => Arc::clone(structure),
            Slot::Encoded(bytes) => {
                let decoded: Arc<dyn Structure> = Arc::new(decode(name, bytes)?);
                entry.flushed_version = Some(decoded.version());
                entry.slot = Slot::Live(Arc::clone(&decoded));
                decoded
            }
        };
        downcast(&structure, name)
    }

    fn lookup<S, D>(&self, kind: Kind, name: &str, element_type: &str, decode: D) -> EngineResult<Option<Arc<S>>>
    where
        S: Structure + 'static,
        D: FnOnce(&str, &[u8]) -> EngineResult<S>,
    {
        {
            let namespace = self.namespace(kind).read().unwrap_or_else(PoisonError::into_inner);
            match namespace.get(name) {
                None => return Ok(None),
                Some(entry) => {
                    self.check_element_type(kind, name, entry, element_type)?;
                    if let Slot::Live(structure) = &entry.slot {
                        return downcast(structure, name).map(Some);
                    }
                }
            }
        }

        let mut namespace = self.namespace(kind).write().unwrap_or_else(PoisonError::into_inner);
        match namespace.get_mut(name) {
            None => Ok(None),
            Some(entry) => Self::resolve(entry, name, decode).map(Some),
        }
    }

    /// Atomic create-if-absent. `dims` is checked against an existing entry.
    fn get_or_create<S, D, C>(
        &self,
        kind: Kind,
        name: &str,
        element_type: &str,
        dims: Option<(usize, usize)>,
        decode: D,
        create: C,
    ) -> EngineResult<Arc<S>>
    where
        S: Structure + 'static,
        D: FnOnce(&str, &[u8]) -> EngineResult<S>,
        C: FnOnce() -> EngineResult<S>,
    {
        if name.is_empty() {
            return Err(EngineError::invalid_argument(format!(
                "{} name must not be empty",
                kind.as_str()
            )));
        }

        let mut namespace = self.namespace(kind).write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = namespace.get_mut(name) {
            self.check_element_type(kind, name, entry, element_type)?;
            if let (Some(existing), Some(requested)) = (entry.dims, dims) {
                if existing != requested {
                    return Err(EngineError::DimensionMismatch {
                        name: name.to_string(),
                        existing,
                        requested,
                    });
                }
            }
            return Self::resolve(entry, name, decode);
        }

        let structure = Arc::new(create()?);
        namespace.insert(
            name.to_string(),
            Entry::live(Arc::clone(&structure) as Arc<dyn Structure>, element_type, dims),
        );
        self.manifest_dirty.store(true, Ordering::Release);
        debug!("Created {} {} in storage {}", kind.as_str(), name, self.name);
        Ok(structure)
    }

    // Arrays

    pub fn array_names(&self) -> Vec<String> {
        self.names(Kind::Array)
    }

    pub fn contains_array(&self, name: &str) -> bool {
        self.contains(Kind::Array, name)
    }

    /// Create an empty array, or return the existing one.
    pub fn create_array<T: Data>(&self, name: &str) -> EngineResult<Arc<Array<T>>> {
        self.get_or_create(
            Kind::Array,
            name,
            type_name::<T>(),
            None,
            Array::decode,
            || Ok(Array::new(name, Vec::new())),
        )
    }

    pub fn get_array<T: Data>(&self, name: &str) -> EngineResult<Option<Arc<Array<T>>>> {
        self.lookup(Kind::Array, name, type_name::<T>(), Array::decode)
    }

    pub fn remove_array(&self, name: &str) -> bool {
        self.remove(Kind::Array, name)
    }

    // Matrices

    pub fn matrix_names(&self) -> Vec<String> {
        self.names(Kind::Matrix)
    }

    pub fn contains_matrix(&self, name: &str) -> bool {
        self.contains(Kind::Matrix, name)
    }

    /// Create a `rows` x `cols` matrix filled with `T::default()`, or return
    /// the existing one. Asking again with other dimensions fails with
    /// `DimensionMismatch`.
    pub fn create_matrix<T: Data + Default>(
        &self,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> EngineResult<Arc<Matrix<T>>> {
        self.get_or_create(
            Kind::Matrix,
            name,
            type_name::<T>(),
            Some((rows, cols)),
            Matrix::decode,
            || Matrix::new(name, rows, cols),
        )
    }

    pub fn get_matrix<T: Data>(&self, name: &str) -> EngineResult<Option<Arc<Matrix<T>>>> {
        self.lookup(Kind::Matrix, name, type_name::<T>(), Matrix::decode)
    }

    pub fn remove_matrix(&self, name: &str) -> bool {
        self.remove(Kind::Matrix, name)
    }

    // Dictionaries

    pub fn dictionary_names(&self) -> Vec<String> {
        self.names(Kind::Dictionary)
    }

    pub fn contains_dictionary(&self, name: &str) -> bool {
        self.contains(Kind::Dictionary, name)
    }

    pub fn create_dictionary(&self, name: &str) -> EngineResult<Arc<Dictionary>> {
        self.get_or_create(
            Kind::Dictionary,
            name,
            DICTIONARY_ELEMENT,
            None,
            Dictionary::decode,
            || Ok(Dictionary::new(name)),
        )
    }

    pub fn get_dictionary(&self, name: &str) -> EngineResult<Option<Arc<Dictionary>>> {
        self.lookup(Kind::Dictionary, name, DICTIONARY_ELEMENT, Dictionary::decode)
    }

    pub fn remove_dictionary(&self, name: &str) -> bool {
        self.remove(Kind::Dictionary, name)
    }

    // Data streams

    pub fn data_stream_names(&self) -> Vec<String> {
        self.names(Kind::DataStream)
    }

    pub fn contains_data_stream(&self, name: &str) -> bool {
        self.contains(Kind::DataStream, name)
    }

    pub fn create_data_stream(&self, name: &str) -> EngineResult<Arc<DataStream>> {
        self.get_or_create(
            Kind::DataStream,
            name,
            STREAM_ELEMENT,
            None,
            DataStream::decode,
            || Ok(DataStream::new(name)),
        )
    }

    pub fn get_data_stream(&self, name: &str) -> EngineResult<Option<Arc<DataStream>>> {
        self.lookup(Kind::DataStream, name, STREAM_ELEMENT, DataStream::decode)
    }

    pub fn remove_data_stream(&self, name: &str) -> bool {
        self.remove(Kind::DataStream, name)
    }

    /// Install a fully written stream under its name in one step, replacing
    /// any existing stream. Readers see either the old or the new records.
    pub(crate) fn replace_data_stream(&self, stream: DataStream) -> Arc<DataStream> {
        let stream = Arc::new(stream);
        let name = stream.name().to_string();
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.clone(),
                Entry::live(Arc::clone(&stream) as Arc<dyn Structure>, STREAM_ELEMENT, None),
            );
        self.manifest_dirty.store(true, Ordering::Release);
        debug!("Replaced stream {} in storage {}", name, self.name);
        stream
    }

    /// True when `flush_data` has something to write.
    pub fn is_dirty(&self) -> bool {
        if self.manifest_dirty.load(Ordering::Acquire) {
            return true;
        }
        Kind::ALL.iter().any(|kind| {
            self.namespace(*kind)
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .any(Entry::is_dirty)
        })
    }

    fn snapshot(&self) -> EngineResult<(Vec<DirtyStructure>, Manifest)> {
        let mut dirty = Vec::new();
        let mut manifest = Manifest {
            storage: self.name.clone(),
            structures: Vec::new(),
        };

        for kind in Kind::ALL {
            let namespace = self.namespace(kind).read().unwrap_or_else(PoisonError::into_inner);
            for (name, entry) in namespace.iter() {
                manifest.structures.push(ManifestEntry {
                    kind,
                    name: name.clone(),
                    element_type: entry.element_type.clone(),
                    dims: entry.dims,
                });
                if let (true, Slot::Live(structure)) = (entry.is_dirty(), &entry.slot) {
                    let version = structure.version();
                    let bytes = structure.encode()?;
                    dirty.push(DirtyStructure {
                        kind,
                        name: name.clone(),
                        structure: Arc::clone(structure),
                        version,
                        bytes,
                    });
                }
            }
        }
        manifest
            .structures
            .sort_by(|a, b| (a.kind.as_str(), &a.name).cmp(&(b.kind.as_str(), &b.name)));
        Ok((dirty, manifest))
    }

    fn mark_flushed(&self, written: &[DirtyStructure]) {
        for item in written {
            let mut namespace = self
                .namespace(item.kind)
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = namespace.get_mut(&item.name) {
                if let Slot::Live(current) = &entry.slot {
                    if std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(&item.structure)) {
                        entry.flushed_version = Some(item.version);
                    }
                }
            }
        }
    }

    /// Write every structure changed since the last checkpoint, pending
    /// removals and the manifest to the backend.
    ///
    /// Returns the number of structures written; `0` means nothing was dirty
    /// and the backend was not touched.
    pub async fn flush_data(&self) -> EngineResult<usize> {
        let _flushing = self.flush_lock.lock().await;

        let stale: Vec<Vec<u8>> = if self.replaces_removed.load(Ordering::Acquire) {
            self.blobs.keys_with_prefix(&Self::key_prefix(&self.name)).await?
        } else {
            Vec::new()
        };
        let deletes: Vec<Vec<u8>> = self
            .pending_deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let manifest_dirty = self.manifest_dirty.swap(false, Ordering::AcqRel);
        let (dirty, manifest) = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.manifest_dirty.fetch_or(manifest_dirty, Ordering::AcqRel);
                return Err(e);
            }
        };

        if dirty.is_empty() && deletes.is_empty() && stale.is_empty() && !manifest_dirty {
            debug!("Storage {} is clean, nothing to flush", self.name);
            return Ok(0);
        }

        let mut operations: Vec<BatchOperation> = stale
            .iter()
            .chain(&deletes)
            .map(|key| BatchOperation::Delete { key: key.clone() })
            .collect();
        let mut bytes_written = 0;
        for item in &dirty {
            bytes_written += item.bytes.len();
            operations.push(BatchOperation::Put {
                key: self.structure_key(item.kind, &item.name),
                value: item.bytes.clone(),
            });
        }
        let manifest_bytes = serde_json::to_vec(&manifest)
            .with_serialization_context(|| format!("manifest of storage {}", self.name))?;
        operations.push(BatchOperation::Put {
            key: Self::manifest_key(&self.name),
            value: manifest_bytes,
        });

        let written = async {
            self.blobs.batch_write(operations).await?;
            self.blobs.flush().await
        }
        .await;
        if let Err(e) = written {
            self.manifest_dirty.store(true, Ordering::Release);
            return Err(e.into());
        }

        self.pending_deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..deletes.len());
        self.replaces_removed.store(false, Ordering::Release);
        self.mark_flushed(&dirty);

        info!(
            "Flushed storage {}: {} structures ({} bytes), {} removals",
            self.name,
            dirty.len(),
            bytes_written,
            stale.len() + deletes.len()
        );
        Ok(dirty.len())
    }
}
