//! Plugin host for Hearth.
//!
//! Runs untrusted plugins against a capability-bound API and guarantees that
//! everything a plugin acquired is withdrawn when it stops, updates or fails
//! to start.
//!
//! # Architecture
//!
//! - [`PluginRuntime`] owns running plugins and drives start/stop/update
//! - [`PluginRegistry`] persists [`PluginRecord`]s through `hearth-store`
//! - [`CapabilityLedger`] records an undo for every grant, by [`CapabilityKind`]
//! - [`PluginApi`] is the only handle plugin code receives; the side effects
//!   behind it come from a [`CapabilityHost`]
//! - [`PluginLoader`] turns a code document into a [`Plugin`]
//! - [`PluginFetcher`] retrieves remote manifests and code

mod api;
mod config;
mod error;
mod fetch;
pub mod host;
mod ledger;
mod loader;
mod plugin;
mod record;
mod registry;
mod runtime;
mod storage;

pub use api::{PluginApi, ScopedCapabilities};
pub use config::{FetchConfig, HostConfig, PluginsConfig, StorageConfig};
pub use error::PluginHostError;
pub use fetch::{resolve, HttpFetcher, PluginFetcher, CODE_FILE, MANIFEST_FILE};
pub use host::{
    AfterHook, BeforeHook, CapabilityHost, DomObserver, EventHandler, InsteadHook,
    InterceptVerdict, Interceptor,
};
pub use ledger::{
    CapabilityKind, CapabilityLedger, RevocationError, RevokeFailure, RevokeHandle, UndoFn,
};
pub use loader::{NativeLoader, PluginLoader};
pub use plugin::{Plugin, SettingsPanel};
pub use record::{Manifest, PluginRecord, HASH_KEY, NAME_KEY};
pub use registry::{PluginRegistry, RECORDS_PARTITION};
pub use runtime::{PluginRuntime, StartAll, UpdateOutcome};
pub use storage::{DataObject, PluginStore, DATA_PARTITION};
