//! Plugin lifecycle: start, stop, update and crash recovery.
//!
//! A plugin is either stopped or running. While running, the runtime holds its
//! instance together with the ledger of everything it was granted; stopping
//! or a failed start revokes the whole ledger, so no side effect outlives the
//! plugin regardless of how well it cleans up after itself.

use crate::api::PluginApi;
use crate::config::{HostConfig, PluginsConfig};
use crate::error::{panic_message, PluginHostError};
use crate::fetch::{HttpFetcher, PluginFetcher};
use crate::host::CapabilityHost;
use crate::ledger::{CapabilityKind, CapabilityLedger};
use crate::loader::PluginLoader;
use crate::plugin::{Plugin, SettingsPanel};
use crate::record::{Manifest, PluginRecord};
use crate::registry::PluginRegistry;
use crate::storage::{DataObject, PluginStore, DATA_PARTITION};
use hearth_store::{ConnectionBroker, ReactiveStore};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Result of [`PluginRuntime::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No update source, or updates are turned off for this plugin.
    NothingToDo,
    /// The remote manifest carries the installed hash; code was not fetched.
    Unchanged,
    /// New code and manifest were stored.
    Updated,
}

struct LoadedPlugin {
    plugin: Box<dyn Plugin>,
    settings: Option<Arc<dyn SettingsPanel>>,
    ledger: Arc<CapabilityLedger>,
    api: PluginApi,
    started_seq: u64,
}

enum Slot {
    /// Being evaluated; holds the id so nothing else starts or updates it.
    Starting,
    Running(LoadedPlugin),
}

#[derive(Default)]
struct LoadedTable {
    slots: HashMap<String, Slot>,
    next_seq: u64,
}

struct RuntimeInner {
    registry: PluginRegistry,
    data: ReactiveStore<DataObject>,
    loader: Arc<dyn PluginLoader>,
    host: Arc<dyn CapabilityHost>,
    fetcher: Arc<dyn PluginFetcher>,
    config: PluginsConfig,
    loaded: Mutex<LoadedTable>,
}

/// Owns every running plugin. Clones share the same state.
#[derive(Clone)]
pub struct PluginRuntime {
    inner: Arc<RuntimeInner>,
}

impl PluginRuntime {
    /// Creates a runtime over `broker`. The record and data partitions are
    /// requested together, so they share one backend open.
    pub fn new(
        broker: &ConnectionBroker,
        loader: Arc<dyn PluginLoader>,
        host: Arc<dyn CapabilityHost>,
        fetcher: Arc<dyn PluginFetcher>,
        config: PluginsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                registry: PluginRegistry::new(broker),
                data: ReactiveStore::new(broker, DATA_PARTITION),
                loader,
                host,
                fetcher,
                config,
                loaded: Mutex::new(LoadedTable::default()),
            }),
        }
    }

    /// Creates a runtime with the configured backend and an HTTP fetcher.
    pub fn from_config(
        config: &HostConfig,
        loader: Arc<dyn PluginLoader>,
        host: Arc<dyn CapabilityHost>,
    ) -> Result<Self, PluginHostError> {
        let broker = ConnectionBroker::new(config.open_backend());
        let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
        Ok(Self::new(&broker, loader, host, fetcher, config.plugins.clone()))
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    pub fn dev_mode_id(&self) -> &str {
        &self.inner.config.dev_mode_id
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    /// Loads and starts `id`.
    ///
    /// Usage errors leave everything untouched. If the plugin itself fails
    /// (error or panic while loading or in `on_load`), every grant it made is
    /// revoked, it is marked disabled and `PluginCrashed` is returned.
    pub fn start(&self, id: &str) -> Result<(), PluginHostError> {
        let record = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| PluginHostError::PluginNotFound(id.to_string()))?;

        let store = {
            let mut loaded = self.lock_loaded();
            if loaded.slots.contains_key(id) {
                return Err(PluginHostError::PluginAlreadyRunning(id.to_string()));
            }
            let store = PluginStore::open(id, &self.inner.data)?;
            loaded.slots.insert(id.to_string(), Slot::Starting);
            store
        };

        let ledger = Arc::new(CapabilityLedger::new());
        let api = PluginApi::new(
            id,
            record.manifest.clone(),
            store,
            Arc::clone(&ledger),
            Arc::clone(&self.inner.host),
        );

        let mut instance: Option<Box<dyn Plugin>> = None;
        let result = catch_unwind(AssertUnwindSafe(|| {
            let plugin = instance.insert(self.inner.loader.load(id, &record.code, api.clone())?);
            plugin.on_load()?;
            anyhow::Ok(plugin.settings())
        }));

        let failure = match result {
            Ok(Ok(settings)) => {
                if let Some(plugin) = instance {
                    api.attach_settings(settings.clone());
                    let mut loaded = self.lock_loaded();
                    loaded.next_seq += 1;
                    let started_seq = loaded.next_seq;
                    loaded.slots.insert(
                        id.to_string(),
                        Slot::Running(LoadedPlugin {
                            plugin,
                            settings,
                            ledger,
                            api,
                            started_seq,
                        }),
                    );
                    drop(loaded);
                    self.set_enabled(id, true);
                    info!(plugin_id = %id, "Plugin started");
                    return Ok(());
                }
                "loader returned no plugin".to_string()
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        error!(plugin_id = %id, error = %failure, "Plugin errored while loading and will be unloaded");
        if let Some(mut plugin) = instance {
            match catch_unwind(AssertUnwindSafe(|| plugin.on_unload())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(plugin_id = %id, error = %format!("{e:#}"), "Plugin errored while unloading"),
                Err(payload) => warn!(plugin_id = %id, error = %panic_message(payload.as_ref()), "Plugin panicked while unloading"),
            }
        }
        if let Err(e) = ledger.close() {
            warn!(plugin_id = %id, error = %e, "Revocation after failed start was incomplete");
        }
        api.flush_store();

        self.lock_loaded().slots.remove(id);
        self.set_enabled(id, false);

        Err(PluginHostError::PluginCrashed {
            plugin_id: id.to_string(),
            message: failure,
        })
    }

    /// Unloads `id` and revokes everything it was granted.
    ///
    /// The plugin ends up stopped and disabled even when revocation partly
    /// fails; those failures are then returned as `RevocationFailed`.
    pub fn stop(&self, id: &str) -> Result<(), PluginHostError> {
        if !self.inner.registry.contains(id) {
            return Err(PluginHostError::PluginNotFound(id.to_string()));
        }

        let loaded = {
            let mut table = self.lock_loaded();
            match table.slots.remove(id) {
                Some(Slot::Running(loaded)) => loaded,
                Some(Slot::Starting) => {
                    table.slots.insert(id.to_string(), Slot::Starting);
                    return Err(PluginHostError::PluginNotRunning(id.to_string()));
                }
                None => return Err(PluginHostError::PluginNotRunning(id.to_string())),
            }
        };

        let LoadedPlugin {
            mut plugin,
            ledger,
            api,
            ..
        } = loaded;

        match catch_unwind(AssertUnwindSafe(|| plugin.on_unload())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(plugin_id = %id, error = %format!("{e:#}"), "Plugin errored while unloading"),
            Err(payload) => warn!(plugin_id = %id, error = %panic_message(payload.as_ref()), "Plugin panicked while unloading"),
        }
        let revoked = ledger.close();
        api.flush_store();
        drop(plugin);

        self.set_enabled(id, false);
        info!(plugin_id = %id, "Plugin stopped");

        revoked.map_err(|source| {
            error!(plugin_id = %id, error = %source, "Capability revocation failed");
            PluginHostError::RevocationFailed {
                plugin_id: id.to_string(),
                source,
            }
        })
    }

    /// Checks the update source of a stopped plugin and stores new code.
    pub async fn update(&self, id: &str) -> Result<UpdateOutcome, PluginHostError> {
        let record = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| PluginHostError::PluginNotFound(id.to_string()))?;
        if self.is_loaded(id) {
            return Err(PluginHostError::PluginAlreadyRunning(id.to_string()));
        }

        let Some(source) = record.poll_source() else {
            return Ok(UpdateOutcome::NothingToDo);
        };
        self.refresh(id, source, record.manifest.hash()).await
    }

    /// Fetches `source` and replaces the code and manifest of `id`, unless the
    /// remote hash equals `installed_hash`.
    async fn refresh(
        &self,
        id: &str,
        source: &str,
        installed_hash: Option<&str>,
    ) -> Result<UpdateOutcome, PluginHostError> {
        let failed = |e: PluginHostError| {
            warn!(plugin_id = %id, error = %e, "Plugin update failed");
            PluginHostError::UpdateFailed {
                plugin_id: id.to_string(),
                message: e.to_string(),
            }
        };

        let manifest = self.inner.fetcher.fetch_manifest(source).await.map_err(failed)?;
        if let (Some(installed), Some(remote)) = (installed_hash, manifest.hash()) {
            if installed == remote {
                debug!(plugin_id = %id, hash = installed, "Plugin is up to date");
                return Ok(UpdateOutcome::Unchanged);
            }
        }

        let code = self.inner.fetcher.fetch_code(source).await.map_err(failed)?;

        // Applied to whatever the record is now; it may have changed while fetching.
        let applied = self.inner.registry.modify(id, |record| {
            record.code = code;
            record.manifest = manifest;
        });
        if !applied {
            return Err(PluginHostError::PluginNotFound(id.to_string()));
        }
        info!(plugin_id = %id, "Plugin updated");
        Ok(UpdateOutcome::Updated)
    }

    /// Boots every enabled plugin once storage is connected.
    ///
    /// Update sources are checked concurrently first, then enabled plugins are
    /// started one by one in registry order. Failures of individual plugins
    /// are collected in the returned [`StartAll`], never propagated.
    pub async fn start_all(&self) -> Result<StartAll, PluginHostError> {
        self.connected().await?;

        let dev_id = self.dev_mode_id();
        let ids: Vec<String> = self
            .inner
            .registry
            .list()
            .into_iter()
            .filter(|id| id != dev_id)
            .collect();

        let mut update_failures = Vec::new();
        if self.inner.config.auto_update {
            let results = futures::future::join_all(ids.iter().map(|id| self.update(id))).await;
            for (id, result) in ids.iter().zip(results) {
                if let Err(e) = result {
                    error!(plugin_id = %id, error = %e, "Update during startup failed");
                    update_failures.push((id.clone(), e));
                }
            }
        }

        let mut started = Vec::new();
        let mut crashed = Vec::new();
        for id in ids {
            let enabled = self.inner.registry.get(&id).is_some_and(|r| r.enabled);
            if !enabled {
                continue;
            }
            match self.start(&id) {
                Ok(()) => started.push(id),
                Err(e) => crashed.push((id, e)),
            }
        }

        info!(started = started.len(), crashed = crashed.len(), "Plugins started");
        Ok(StartAll {
            runtime: self.clone(),
            started,
            crashed,
            update_failures,
        })
    }

    /// Stops every running plugin in start order, collecting failures.
    pub fn stop_all(&self) -> Vec<(String, PluginHostError)> {
        self.running_ids()
            .into_iter()
            .filter_map(|id| self.stop(&id).err().map(|e| (id, e)))
            .collect()
    }

    // ================================================================
    // Installation
    // ================================================================

    /// Installs a plugin from local code. It starts out disabled.
    pub fn install_local(&self, id: &str, mut record: PluginRecord) -> Result<(), PluginHostError> {
        self.check_new_id(id)?;
        record.enabled = false;
        self.inner.registry.put(id, record);
        info!(plugin_id = %id, "Installed local plugin");
        Ok(())
    }

    /// Installs a plugin from `source`, fetching its manifest and code now.
    /// Nothing is kept if the fetch fails.
    pub async fn install_remote(
        &self,
        id: &str,
        source: &str,
        update: bool,
    ) -> Result<(), PluginHostError> {
        self.check_new_id(id)?;
        self.inner.registry.put(id, PluginRecord::remote(source, update));

        match self.refresh(id, source, None).await {
            Ok(UpdateOutcome::Updated) => {
                info!(plugin_id = %id, source, "Installed remote plugin");
                Ok(())
            }
            Ok(_) => {
                self.inner.registry.remove(id);
                Err(PluginHostError::UpdateFailed {
                    plugin_id: id.to_string(),
                    message: "nothing was fetched".to_string(),
                })
            }
            Err(e) => {
                self.inner.registry.remove(id);
                Err(e)
            }
        }
    }

    /// Removes `id`, stopping it first if it is running. Its stored data is
    /// deleted too.
    pub fn remove(&self, id: &str) -> Result<(), PluginHostError> {
        if !self.inner.registry.contains(id) {
            return Err(PluginHostError::PluginNotFound(id.to_string()));
        }

        let stopped = if self.is_running(id) { self.stop(id) } else { Ok(()) };

        self.inner.registry.remove(id);
        self.inner.data.delete(id);
        info!(plugin_id = %id, "Plugin removed");
        stopped
    }

    /// Creates or replaces the reserved development plugin. Its enabled flag
    /// is kept.
    pub fn install_dev_plugin(&self, code: impl Into<String>, manifest: Manifest) {
        let id = self.dev_mode_id();
        let code = code.into();
        let replaced = self.inner.registry.modify(id, |record| {
            record.code = code.clone();
            record.manifest = manifest.clone();
        });
        if !replaced {
            self.inner.registry.put(id, PluginRecord::local(code, manifest));
        }
        debug!(plugin_id = %id, "Dev plugin replaced");
    }

    // ================================================================
    // Queries
    // ================================================================

    pub fn is_running(&self, id: &str) -> bool {
        matches!(self.lock_loaded().slots.get(id), Some(Slot::Running(_)))
    }

    /// Running plugin ids in start order.
    pub fn running_ids(&self) -> Vec<String> {
        let table = self.lock_loaded();
        let mut running: Vec<(u64, &String)> = table
            .slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Running(loaded) => Some((loaded.started_seq, id)),
                Slot::Starting => None,
            })
            .collect();
        running.sort_unstable_by_key(|(seq, _)| *seq);
        running.into_iter().map(|(_, id)| id.clone()).collect()
    }

    /// Settings panel of a running plugin.
    pub fn settings(&self, id: &str) -> Option<Arc<dyn SettingsPanel>> {
        match self.lock_loaded().slots.get(id) {
            Some(Slot::Running(loaded)) => loaded.settings.clone(),
            _ => None,
        }
    }

    /// Presents the settings panel of a running plugin through the host.
    pub fn show_settings(&self, id: &str) -> Result<(), PluginHostError> {
        let api = match self.lock_loaded().slots.get(id) {
            Some(Slot::Running(loaded)) => loaded.api.clone(),
            _ => return Err(PluginHostError::PluginNotRunning(id.to_string())),
        };
        api.show_settings()
    }

    /// Number of grants `id` currently holds, if running.
    pub fn grant_count(&self, id: &str) -> Option<usize> {
        match self.lock_loaded().slots.get(id) {
            Some(Slot::Running(loaded)) => Some(
                CapabilityKind::ALL
                    .iter()
                    .map(|kind| loaded.ledger.len(*kind))
                    .sum(),
            ),
            _ => None,
        }
    }

    /// Waits until both the record and data partitions are connected.
    pub async fn connected(&self) -> Result<(), PluginHostError> {
        let (records, data) =
            futures::join!(self.inner.registry.connected(), self.inner.data.connected());
        records?;
        data?;
        Ok(())
    }

    /// Writes through the data of every running plugin and waits until all
    /// record and data writes so far are durable.
    pub async fn flush(&self) -> Result<(), PluginHostError> {
        let apis: Vec<PluginApi> = self
            .lock_loaded()
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(loaded) => Some(loaded.api.clone()),
                Slot::Starting => None,
            })
            .collect();
        for api in apis {
            api.flush_store();
        }
        self.inner.registry.flush().await?;
        self.inner.data.flush().await?;
        Ok(())
    }

    // ================================================================
    // Internals
    // ================================================================

    fn check_new_id(&self, id: &str) -> Result<(), PluginHostError> {
        if id.trim().is_empty() || id == self.dev_mode_id() || self.inner.registry.contains(id) {
            return Err(PluginHostError::InvalidPluginId(id.to_string()));
        }
        Ok(())
    }

    fn is_loaded(&self, id: &str) -> bool {
        self.lock_loaded().slots.contains_key(id)
    }

    fn set_enabled(&self, id: &str, enabled: bool) {
        self.inner.registry.modify(id, |record| record.enabled = enabled);
    }

    fn lock_loaded(&self) -> MutexGuard<'_, LoadedTable> {
        self.inner.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of [`PluginRuntime::start_all`].
pub struct StartAll {
    runtime: PluginRuntime,
    /// Ids started, in start order.
    pub started: Vec<String>,
    /// Ids whose start failed.
    pub crashed: Vec<(String, PluginHostError)>,
    /// Ids whose update check failed; they were still started if enabled.
    pub update_failures: Vec<(String, PluginHostError)>,
}

impl StartAll {
    /// Stops every running plugin.
    pub fn teardown(self) -> Vec<(String, PluginHostError)> {
        let failures = self.runtime.stop_all();
        for (id, e) in &failures {
            warn!(plugin_id = %id, error = %e, "Plugin failed to stop cleanly");
        }
        failures
    }
}
