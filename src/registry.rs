//! Registry of open data stores
//!
//! [`DataStores`] maps a [`Guid`] to its open [`DataStore`], opening stores
//! lazily under `<base_path>/<guid>.data`. It owns the background
//! [`DataStoreFlusher`] and the fault-injection listener shared by every
//! store it opens.

use crate::config::DataStoresConfig;
use crate::datastore::{DataStore, DataStoreContext, Guid};
use crate::error::{DataStoreError, Result};
use crate::fault::InjectedErrorListener;
use crate::flusher::DataStoreFlusher;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Size report for one open store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataStoreInfo {
    pub guid: Guid,
    pub file_size: u64,
    pub file_blocks: u64,
    pub reserved_bytes: u64,
    pub free_bytes: u64,
}

/// Sink for [`DataStores::list_data_stores`]
pub trait ListDataStoresBuilder {
    fn add(&mut self, info: DataStoreInfo);
}

impl ListDataStoresBuilder for Vec<DataStoreInfo> {
    fn add(&mut self, info: DataStoreInfo) {
        self.push(info);
    }
}

struct Registry {
    base_path: PathBuf,
    context: Arc<DataStoreContext>,
    stores: BTreeMap<Guid, Arc<DataStore>>,
}

impl Registry {
    fn data_path(&self, guid: Guid) -> PathBuf {
        self.base_path.join(format!("{}.data", guid))
    }

    fn open_store(&self, guid: Guid) -> Result<Arc<DataStore>> {
        let store = DataStore::open(self.data_path(guid), guid, Arc::clone(&self.context))?;
        Ok(Arc::new(store))
    }

    fn snapshot(&self) -> Vec<Arc<DataStore>> {
        self.stores.values().cloned().collect()
    }
}

/// Files owned by some store: `<guid>.data`, its side file, staged side file
/// and data files removed while still held open
fn is_store_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| {
            name.ends_with(".data")
                || name.ends_with(".data.fl")
                || name.ends_with(".data.fl.tmp")
                || name.contains(".data.removed-")
        })
}

/// Guid of a `<guid>.data` file name
fn parse_data_file_name(path: &Path) -> Option<Guid> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".data")?.parse().ok()
}

/// Flush `guid` if it is still open; closed stores are never reopened
fn flush_open_store(registry: &Weak<Mutex<Option<Registry>>>, guid: Guid) -> Result<()> {
    let Some(registry) = registry.upgrade() else {
        return Ok(());
    };
    let store = registry
        .lock()
        .as_ref()
        .and_then(|registry| registry.stores.get(&guid).cloned());

    match store {
        Some(store) => store.flush(),
        None => Ok(()),
    }
}

/// All data stores under one base directory
///
/// Constructed empty; [`init_data_stores`](Self::init_data_stores) must run
/// before any store is requested.
pub struct DataStores {
    registry: Arc<Mutex<Option<Registry>>>,
    flusher: DataStoreFlusher,
    listener: Arc<InjectedErrorListener>,
}

impl DataStores {
    pub fn new() -> Self {
        DataStores {
            registry: Arc::new(Mutex::new(None)),
            flusher: DataStoreFlusher::new(),
            listener: Arc::new(InjectedErrorListener::new()),
        }
    }

    /// Create the base directory and start background services
    ///
    /// Calling this again after a successful init does nothing.
    pub fn init_data_stores(&self, config: DataStoresConfig) -> Result<()> {
        {
            let mut registry = self.registry.lock();
            if registry.is_some() {
                tracing::debug!("Data stores already initialized");
                return Ok(());
            }

            config.validate()?;
            fs::create_dir_all(&config.base_path)?;

            let context = DataStoreContext::new(
                config.min_alloc_size,
                self.flusher.queue(),
                Arc::clone(&self.listener),
            );
            *registry = Some(Registry {
                base_path: config.base_path.clone(),
                context: Arc::new(context),
                stores: BTreeMap::new(),
            });
        }

        if let Some(interval) = config.sync_interval_duration() {
            let registry = Arc::downgrade(&self.registry);
            self.flusher
                .start(interval, move |guid| flush_open_store(&registry, guid))?;
        }
        self.listener.start();

        tracing::info!(
            "Initialized data stores at {:?} (min alloc {} bytes)",
            config.base_path,
            config.min_alloc_size
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.lock().is_some()
    }

    /// Return the open store for `guid`, opening or creating it if needed
    pub fn get_data_store(&self, guid: Guid) -> Result<Arc<DataStore>> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(DataStoreError::NotInitialized)?;

        if let Some(store) = registry.stores.get(&guid) {
            return Ok(Arc::clone(store));
        }

        let store = registry.open_store(guid)?;
        registry.stores.insert(guid, Arc::clone(&store));
        tracing::info!("Opened data store {} at {:?}", guid, store.path());

        Ok(store)
    }

    /// Forget the store for `guid`
    ///
    /// Without `remove` the store is flushed first. With `remove` the side
    /// file is deleted and the data file leaves the directory right away;
    /// outstanding handles keep working on it until the last one is dropped.
    /// A store that is not open is opened first so its files can be removed.
    pub fn close_data_store(&self, guid: Guid, remove: bool) -> Result<()> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(DataStoreError::NotInitialized)?;

        if !remove {
            if let Some(store) = registry.stores.get(&guid) {
                store.flush()?;
            }
        }

        let store = match registry.stores.remove(&guid) {
            Some(store) => store,
            None if remove => registry.open_store(guid)?,
            None => return Ok(()),
        };

        if remove {
            store.remove_freelist_file()?;
            store.remove_on_close()?;
            tracing::info!("Removed data store {}", guid);
        } else {
            tracing::debug!("Closed data store {}", guid);
        }

        Ok(())
    }

    /// Flush every open store
    ///
    /// Every store is attempted; the first failure is returned.
    pub fn flush_all_data_stores(&self) -> Result<()> {
        let stores = {
            let guard = self.registry.lock();
            let registry = guard.as_ref().ok_or(DataStoreError::NotInitialized)?;
            registry.snapshot()
        };

        let mut first_error = None;
        for store in stores {
            if let Err(e) = store.flush() {
                tracing::error!("Failed to flush data store {}: {}", store.guid(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every store and delete all store files under the base path
    pub fn clear_all_data_stores(&self) -> Result<()> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(DataStoreError::NotInitialized)?;

        registry.stores.clear();

        let mut removed = 0usize;
        for entry in fs::read_dir(&registry.base_path)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() || !is_store_file(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            "Cleared data stores at {:?} ({} files removed)",
            registry.base_path,
            removed
        );
        Ok(())
    }

    /// Report every open store to `builder`
    pub fn list_data_stores<B: ListDataStoresBuilder + ?Sized>(&self, builder: &mut B) -> Result<()> {
        let stores = {
            let guard = self.registry.lock();
            let registry = guard.as_ref().ok_or(DataStoreError::NotInitialized)?;
            registry.snapshot()
        };

        for store in stores {
            let sizes = store.get_sizes()?;
            builder.add(DataStoreInfo {
                guid: store.guid(),
                file_size: sizes.file_size,
                file_blocks: sizes.file_blocks,
                reserved_bytes: sizes.reserved_bytes,
                free_bytes: sizes.free_bytes,
            });
        }

        Ok(())
    }

    /// Guids of every `<guid>.data` file under the base path, open or not
    pub fn discover_data_stores(&self) -> Result<Vec<Guid>> {
        let base_path = self.base_path()?;
        let mut guids = Vec::new();

        for entry in fs::read_dir(&base_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(guid) = parse_data_file_name(&entry.path()) {
                guids.push(guid);
            }
        }

        guids.sort_unstable();
        Ok(guids)
    }

    pub fn min_alloc_size(&self) -> Result<u64> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(DataStoreError::NotInitialized)?;
        Ok(registry.context.min_alloc_size())
    }

    pub fn base_path(&self) -> Result<PathBuf> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(DataStoreError::NotInitialized)?;
        Ok(registry.base_path.clone())
    }

    pub fn flusher(&self) -> &DataStoreFlusher {
        &self.flusher
    }

    pub fn error_listener(&self) -> Arc<InjectedErrorListener> {
        Arc::clone(&self.listener)
    }
}

impl Default for DataStores {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DataStores {
    fn drop(&mut self) {
        self.flusher.stop();
        self.listener.stop();
    }
}
