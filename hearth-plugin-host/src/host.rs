//! Side-effecting primitives the embedding application provides.
//!
//! The plugin host never performs these effects itself. It calls through
//! [`CapabilityHost`] and records the undo callback each primitive returns in
//! the calling plugin's ledger.

use crate::ledger::UndoFn;
use crate::plugin::SettingsPanel;
use serde_json::Value;
use std::sync::Arc;

/// Event bus listener.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Decision returned by a dispatch interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptVerdict {
    Pass,
    Block,
}

/// Sees every dispatched action before listeners do.
pub type Interceptor = Arc<dyn Fn(&Value) -> InterceptVerdict + Send + Sync>;

/// Called with each element matching an observed selector.
pub type DomObserver = Arc<dyn Fn(&Value) + Send + Sync>;

/// Runs before the patched function and may rewrite its arguments.
pub type BeforeHook = Arc<dyn Fn(&mut Vec<Value>) + Send + Sync>;

/// Runs after the patched function with its arguments and may rewrite the result.
pub type AfterHook = Arc<dyn Fn(&[Value], &mut Value) + Send + Sync>;

/// Replaces the patched function; receives the original as its second argument.
pub type InsteadHook = Arc<dyn Fn(&[Value], &dyn Fn(&[Value]) -> Value) -> Value + Send + Sync>;

/// Primitives backing the capability API.
pub trait CapabilityHost: Send + Sync {
    fn subscribe(&self, event: &str, handler: &EventHandler) -> anyhow::Result<()>;

    /// Inverse of [`CapabilityHost::subscribe`] for the same handler.
    fn unsubscribe(&self, event: &str, handler: &EventHandler) -> anyhow::Result<()>;

    fn intercept(&self, interceptor: Interceptor) -> anyhow::Result<UndoFn>;

    fn observe_dom(&self, selector: &str, observer: DomObserver) -> anyhow::Result<UndoFn>;

    fn before(&self, target: &str, hook: BeforeHook) -> anyhow::Result<UndoFn>;

    fn after(&self, target: &str, hook: AfterHook) -> anyhow::Result<UndoFn>;

    fn instead(&self, target: &str, hook: InsteadHook) -> anyhow::Result<UndoFn>;

    fn inject_css(&self, css: &str) -> anyhow::Result<UndoFn>;

    fn show_settings(&self, title: &str, panel: Arc<dyn SettingsPanel>) -> anyhow::Result<()>;
}

/// In-memory host recording every registration, for tests and headless embedding.
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    #[derive(Default)]
    struct Recorded {
        log: Vec<String>,
        active: Vec<String>,
        handlers: Vec<(String, EventHandler)>,
        fail_undo: HashSet<String>,
        fail_register: HashSet<String>,
        settings_shown: Vec<(String, Value)>,
    }

    /// Host that records registrations as labels such as `subscribe:ready`,
    /// `before:editor.save` or `css:body{}`, and undos as `undo:<label>`.
    #[derive(Clone, Default)]
    pub struct RecordingHost {
        inner: Arc<Mutex<Recorded>>,
    }

    impl RecordingHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every registration and undo, in order.
        pub fn log(&self) -> Vec<String> {
            self.lock().log.clone()
        }

        /// Registrations not yet undone.
        pub fn active(&self) -> Vec<String> {
            self.lock().active.clone()
        }

        pub fn undo_count(&self) -> usize {
            self.lock()
                .log
                .iter()
                .filter(|entry| entry.starts_with("undo:"))
                .count()
        }

        /// Makes undoing `label` fail.
        pub fn fail_undo(&self, label: &str) {
            self.lock().fail_undo.insert(label.to_string());
        }

        /// Makes registering `label` fail.
        pub fn fail_register(&self, label: &str) {
            self.lock().fail_register.insert(label.to_string());
        }

        /// Calls every handler subscribed to `event`; returns how many ran.
        pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
            let handlers: Vec<EventHandler> = self
                .lock()
                .handlers
                .iter()
                .filter(|(e, _)| e == event)
                .map(|(_, h)| Arc::clone(h))
                .collect();
            for handler in &handlers {
                handler(payload);
            }
            handlers.len()
        }

        /// Titles and rendered panels passed to `show_settings`.
        pub fn settings_shown(&self) -> Vec<(String, Value)> {
            self.lock().settings_shown.clone()
        }

        fn lock(&self) -> MutexGuard<'_, Recorded> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn register(&self, label: String) -> anyhow::Result<UndoFn> {
            {
                let mut rec = self.lock();
                if rec.fail_register.contains(&label) {
                    anyhow::bail!("registration of {label} rejected");
                }
                rec.log.push(label.clone());
                rec.active.push(label.clone());
            }
            let host = self.clone();
            Ok(Box::new(move || host.undo(&label)))
        }

        fn undo(&self, label: &str) -> anyhow::Result<()> {
            let mut rec = self.lock();
            rec.log.push(format!("undo:{label}"));
            if let Some(pos) = rec.active.iter().position(|l| l == label) {
                rec.active.remove(pos);
            }
            if rec.fail_undo.contains(label) {
                anyhow::bail!("undo of {label} failed");
            }
            Ok(())
        }
    }

    impl CapabilityHost for RecordingHost {
        fn subscribe(&self, event: &str, handler: &EventHandler) -> anyhow::Result<()> {
            let label = format!("subscribe:{event}");
            let mut rec = self.lock();
            if rec.fail_register.contains(&label) {
                anyhow::bail!("registration of {label} rejected");
            }
            rec.log.push(label.clone());
            rec.active.push(label);
            rec.handlers.push((event.to_string(), Arc::clone(handler)));
            Ok(())
        }

        fn unsubscribe(&self, event: &str, handler: &EventHandler) -> anyhow::Result<()> {
            let label = format!("subscribe:{event}");
            {
                let mut rec = self.lock();
                rec.handlers
                    .retain(|(e, h)| !(e == event && Arc::ptr_eq(h, handler)));
            }
            self.undo(&label)
        }

        fn intercept(&self, _interceptor: Interceptor) -> anyhow::Result<UndoFn> {
            self.register("intercept".to_string())
        }

        fn observe_dom(&self, selector: &str, _observer: DomObserver) -> anyhow::Result<UndoFn> {
            self.register(format!("observe:{selector}"))
        }

        fn before(&self, target: &str, _hook: BeforeHook) -> anyhow::Result<UndoFn> {
            self.register(format!("before:{target}"))
        }

        fn after(&self, target: &str, _hook: AfterHook) -> anyhow::Result<UndoFn> {
            self.register(format!("after:{target}"))
        }

        fn instead(&self, target: &str, _hook: InsteadHook) -> anyhow::Result<UndoFn> {
            self.register(format!("instead:{target}"))
        }

        fn inject_css(&self, css: &str) -> anyhow::Result<UndoFn> {
            self.register(format!("css:{css}"))
        }

        fn show_settings(&self, title: &str, panel: Arc<dyn SettingsPanel>) -> anyhow::Result<()> {
            let rendered = panel.render();
            let mut rec = self.lock();
            rec.log.push(format!("settings:{title}"));
            rec.settings_shown.push((title.to_string(), rendered));
            Ok(())
        }
    }

}
