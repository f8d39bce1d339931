//! The capability-bound API handed to plugin code.
//!
//! Every side-effecting method goes through [`CapabilityHost`] and records
//! its undo in the plugin's [`CapabilityLedger`], so the runtime can withdraw
//! it later without the plugin's cooperation.

use crate::error::PluginHostError;
use crate::host::{
    AfterHook, BeforeHook, CapabilityHost, DomObserver, EventHandler, InsteadHook,
    InterceptVerdict, Interceptor,
};
use crate::ledger::{CapabilityKind, CapabilityLedger, RevokeHandle, UndoFn};
use crate::plugin::SettingsPanel;
use crate::record::Manifest;
use crate::storage::PluginStore;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

struct ApiInner {
    plugin_id: String,
    manifest: Manifest,
    store: PluginStore,
    scoped: ScopedCapabilities,
    settings: Mutex<Option<Arc<dyn SettingsPanel>>>,
}

/// Everything a plugin can reach. Clones refer to the same plugin.
#[derive(Clone)]
pub struct PluginApi {
    inner: Arc<ApiInner>,
}

impl PluginApi {
    pub(crate) fn new(
        plugin_id: &str,
        manifest: Manifest,
        store: PluginStore,
        ledger: Arc<CapabilityLedger>,
        host: Arc<dyn CapabilityHost>,
    ) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                plugin_id: plugin_id.to_string(),
                manifest,
                store,
                scoped: ScopedCapabilities { ledger, host },
                settings: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    pub fn store(&self) -> &PluginStore {
        &self.inner.store
    }

    /// Writes the plugin's data object through to the backing store.
    pub fn flush_store(&self) {
        self.inner.store.flush();
    }

    pub fn scoped(&self) -> &ScopedCapabilities {
        &self.inner.scoped
    }

    /// Opens the plugin's settings panel, titled with the manifest name.
    pub fn show_settings(&self) -> Result<(), PluginHostError> {
        let panel = self
            .inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PluginHostError::NoSettings(self.inner.plugin_id.clone()))?;
        let title = self.inner.manifest.name().unwrap_or(self.inner.plugin_id.as_str());
        self.inner
            .scoped
            .host
            .show_settings(title, panel)
            .map_err(|e| PluginHostError::Capability {
                capability: "settings",
                message: format!("{e:#}"),
            })
    }

    pub(crate) fn attach_settings(&self, panel: Option<Arc<dyn SettingsPanel>>) {
        *self
            .inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = panel;
    }
}

/// Revocable capabilities of one plugin.
#[derive(Clone)]
pub struct ScopedCapabilities {
    ledger: Arc<CapabilityLedger>,
    host: Arc<dyn CapabilityHost>,
}

impl ScopedCapabilities {
    /// Listens for `event` on the host event bus.
    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<RevokeHandle, PluginHostError> {
        let handler: EventHandler = Arc::new(handler);
        let host = Arc::clone(&self.host);
        let event = event.to_string();
        self.grant(CapabilityKind::Subscribe, move || {
            host.subscribe(&event, &handler)?;
            let undo: UndoFn = Box::new(move || host.unsubscribe(&event, &handler));
            Ok(undo)
        })
    }

    pub fn intercept(
        &self,
        interceptor: impl Fn(&Value) -> InterceptVerdict + Send + Sync + 'static,
    ) -> Result<RevokeHandle, PluginHostError> {
        let interceptor: Interceptor = Arc::new(interceptor);
        self.grant(CapabilityKind::Intercept, || self.host.intercept(interceptor))
    }

    pub fn observe_dom(
        &self,
        selector: &str,
        observer: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<RevokeHandle, PluginHostError> {
        let observer: DomObserver = Arc::new(observer);
        self.grant(CapabilityKind::Observe, || self.host.observe_dom(selector, observer))
    }

    pub fn before(
        &self,
        target: &str,
        hook: impl Fn(&mut Vec<Value>) + Send + Sync + 'static,
    ) -> Result<RevokeHandle, PluginHostError> {
        let hook: BeforeHook = Arc::new(hook);
        self.grant(CapabilityKind::Before, || self.host.before(target, hook))
    }

    pub fn after(
        &self,
        target: &str,
        hook: impl Fn(&[Value], &mut Value) + Send + Sync + 'static,
    ) -> Result<RevokeHandle, PluginHostError> {
        let hook: AfterHook = Arc::new(hook);
        self.grant(CapabilityKind::After, || self.host.after(target, hook))
    }

    pub fn instead(
        &self,
        target: &str,
        hook: impl Fn(&[Value], &dyn Fn(&[Value]) -> Value) -> Value + Send + Sync + 'static,
    ) -> Result<RevokeHandle, PluginHostError> {
        let hook: InsteadHook = Arc::new(hook);
        self.grant(CapabilityKind::Instead, || self.host.instead(target, hook))
    }

    pub fn inject_css(&self, css: &str) -> Result<RevokeHandle, PluginHostError> {
        self.grant(CapabilityKind::InjectCss, || self.host.inject_css(css))
    }

    /// Withdraws every grant of `kind`.
    pub fn remove(&self, kind: CapabilityKind) -> Result<(), PluginHostError> {
        self.ledger.revoke(kind).map_err(|e| PluginHostError::Capability {
            capability: kind.as_str(),
            message: e.to_string(),
        })
    }

    /// Withdraws every grant this plugin holds.
    pub fn remove_all(&self) -> Result<(), PluginHostError> {
        self.ledger.revoke_all().map_err(|e| PluginHostError::Capability {
            capability: "all",
            message: e.to_string(),
        })
    }

    fn grant<F>(&self, kind: CapabilityKind, register: F) -> Result<RevokeHandle, PluginHostError>
    where
        F: FnOnce() -> anyhow::Result<UndoFn>,
    {
        debug!(capability = %kind, "Granting capability");
        self.ledger
            .grant(kind, register)
            .map_err(|e| PluginHostError::Capability {
                capability: kind.as_str(),
                message: format!("{e:#}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::RecordingHost;
    use crate::storage::{DataObject, PluginStore, DATA_PARTITION};
    use hearth_store::{ConnectionBroker, MemoryBackend, ReactiveStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Panel;

    impl SettingsPanel for Panel {
        fn render(&self) -> Value {
            json!({ "fields": ["color"] })
        }
    }

    async fn api_with(host: &RecordingHost, manifest: Manifest) -> (PluginApi, Arc<CapabilityLedger>) {
        let broker = ConnectionBroker::new(Arc::new(MemoryBackend::new()));
        let backing: ReactiveStore<DataObject> = ReactiveStore::new(&broker, DATA_PARTITION);
        backing.connected().await.unwrap();
        let store = PluginStore::open("demo", &backing).unwrap();
        let ledger = Arc::new(CapabilityLedger::new());
        let api = PluginApi::new("demo", manifest, store, Arc::clone(&ledger), Arc::new(host.clone()));
        (api, ledger)
    }

    #[tokio::test]
    async fn subscribe_records_inverse_registration() {
        let host = RecordingHost::new();
        let (api, ledger) = api_with(&host, Manifest::new()).await;

        let handle = api.scoped().subscribe("ready", |_| {}).unwrap();
        assert_eq!(ledger.len(CapabilityKind::Subscribe), 1);
        assert_eq!(host.dispatch("ready", &json!(null)), 1);

        handle.revoke().unwrap();
        assert_eq!(host.dispatch("ready", &json!(null)), 0);
        ledger.revoke_all().unwrap();
        assert_eq!(host.undo_count(), 1);
    }

    #[tokio::test]
    async fn rejected_registration_is_not_recorded() {
        let host = RecordingHost::new();
        host.fail_register("css:body{}");
        let (api, ledger) = api_with(&host, Manifest::new()).await;

        let err = api.scoped().inject_css("body{}").unwrap_err();
        assert!(matches!(err, PluginHostError::Capability { capability: "inject-css", .. }));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn remove_kind_only_touches_that_kind() {
        let host = RecordingHost::new();
        let (api, ledger) = api_with(&host, Manifest::new()).await;

        api.scoped().before("editor.save", |_| {}).unwrap();
        api.scoped().after("editor.save", |_, _| {}).unwrap();
        api.scoped().remove(CapabilityKind::Before).unwrap();

        assert_eq!(host.active(), vec!["after:editor.save"]);
        assert_eq!(ledger.len(CapabilityKind::After), 1);
    }

    #[tokio::test]
    async fn remove_all_reports_failed_undos() {
        let host = RecordingHost::new();
        host.fail_undo("observe:.message");
        let (api, ledger) = api_with(&host, Manifest::new()).await;

        api.scoped().observe_dom(".message", |_| {}).unwrap();
        api.scoped().intercept(|_| InterceptVerdict::Block).unwrap();
        let err = api.scoped().remove_all().unwrap_err();

        assert!(matches!(err, PluginHostError::Capability { capability: "all", .. }));
        assert!(ledger.is_empty());
        assert!(host.active().is_empty());
    }

    #[tokio::test]
    async fn show_settings_uses_manifest_name() {
        let host = RecordingHost::new();
        let manifest: Manifest = [("name", "Word Count")].into_iter().collect();
        let (api, _) = api_with(&host, manifest).await;

        assert!(matches!(api.show_settings(), Err(PluginHostError::NoSettings(_))));
        api.attach_settings(Some(Arc::new(Panel)));
        api.show_settings().unwrap();

        assert_eq!(
            host.settings_shown(),
            vec![("Word Count".to_string(), json!({ "fields": ["color"] }))]
        );
    }
}
