//! Per-plugin ledger of revocable capability grants.
//!
//! Seven fixed categories, each an ordered list of undo callbacks:
//! - subscribe: event bus subscriptions
//! - intercept: dispatch interceptors
//! - observe: DOM observers
//! - before / after / instead: function patches
//! - inject-css: injected stylesheets
//!
//! Revoking a category runs its callbacks in grant order and always leaves the
//! category empty, so revoking twice is a no-op. A closed ledger refuses
//! every later grant and undoes anything registered while it was closing.

use crate::error::panic_message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Undo callback returned by a capability primitive.
pub type UndoFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Capability category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    Subscribe,
    Intercept,
    Observe,
    Before,
    After,
    Instead,
    InjectCss,
}

impl CapabilityKind {
    /// Every category, in revocation order.
    pub const ALL: [CapabilityKind; 7] = [
        Self::Subscribe,
        Self::Intercept,
        Self::Observe,
        Self::Before,
        Self::After,
        Self::Instead,
        Self::InjectCss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Intercept => "intercept",
            Self::Observe => "observe",
            Self::Before => "before",
            Self::After => "after",
            Self::Instead => "instead",
            Self::InjectCss => "inject-css",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to one grant. Running it undoes the grant; only the first run has
/// any effect, whether it comes from the plugin or from the ledger.
#[derive(Clone)]
pub struct RevokeHandle {
    undo: Arc<Mutex<Option<UndoFn>>>,
}

impl RevokeHandle {
    pub fn new(undo: UndoFn) -> Self {
        Self {
            undo: Arc::new(Mutex::new(Some(undo))),
        }
    }

    pub fn revoke(&self) -> anyhow::Result<()> {
        let undo = self
            .undo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match undo {
            Some(undo) => undo(),
            None => Ok(()),
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.undo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for RevokeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevokeHandle")
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

/// One undo callback that failed or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeFailure {
    pub kind: CapabilityKind,
    pub message: String,
}

/// Every failure of one revocation pass.
#[derive(Debug, Clone, Error)]
#[error("{} revocation callback(s) failed: {}", .failures.len(), summary(.failures))]
pub struct RevocationError {
    pub failures: Vec<RevokeFailure>,
}

fn summary(failures: &[RevokeFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.kind, failure.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Default)]
struct Slots {
    kinds: [Vec<RevokeHandle>; 7],
    closed: bool,
}

/// Grants held by one plugin, grouped by category.
#[derive(Default)]
pub struct CapabilityLedger {
    slots: Mutex<Slots>,
}

impl CapabilityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `register`, which performs the side effect and returns its undo,
    /// and records the undo under `kind`. Nothing is recorded if `register`
    /// fails. A closed ledger refuses the grant; if it closed while
    /// `register` ran, the undo runs before the refusal is returned.
    pub fn grant<F>(&self, kind: CapabilityKind, register: F) -> anyhow::Result<RevokeHandle>
    where
        F: FnOnce() -> anyhow::Result<UndoFn>,
    {
        if self.is_closed() {
            anyhow::bail!("{kind} refused: plugin is no longer running");
        }
        let handle = RevokeHandle::new(register()?);
        {
            let mut slots = self.lock();
            if !slots.closed {
                slots.kinds[kind.index()].push(handle.clone());
                return Ok(handle);
            }
        }

        let refused = anyhow::anyhow!("{kind} refused: plugin is no longer running");
        match handle.revoke() {
            Ok(()) => Err(refused),
            Err(e) => Err(refused.context(format!("undo failed: {e:#}"))),
        }
    }

    /// Refuses every later grant, then revokes everything held.
    pub fn close(&self) -> Result<(), RevocationError> {
        self.lock().closed = true;
        self.revoke_all()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Undoes every grant of `kind` in grant order and clears the category.
    /// A failing callback does not stop the ones after it.
    pub fn revoke(&self, kind: CapabilityKind) -> Result<(), RevocationError> {
        let failures = self.revoke_collect(kind);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RevocationError { failures })
        }
    }

    /// Revokes every category in [`CapabilityKind::ALL`] order.
    pub fn revoke_all(&self) -> Result<(), RevocationError> {
        let failures: Vec<RevokeFailure> = CapabilityKind::ALL
            .into_iter()
            .flat_map(|kind| self.revoke_collect(kind))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RevocationError { failures })
        }
    }

    pub fn len(&self, kind: CapabilityKind) -> usize {
        self.lock().kinds[kind.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().kinds.iter().all(Vec::is_empty)
    }

    fn revoke_collect(&self, kind: CapabilityKind) -> Vec<RevokeFailure> {
        // Taken out first: callbacks may grant or revoke on this ledger.
        let handles = std::mem::take(&mut self.lock().kinds[kind.index()]);

        handles
            .into_iter()
            .filter_map(|handle| {
                let message = match catch_unwind(AssertUnwindSafe(|| handle.revoke())) {
                    Ok(Ok(())) => return None,
                    Ok(Err(e)) => format!("{e:#}"),
                    Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
                };
                Some(RevokeFailure { kind, message })
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
