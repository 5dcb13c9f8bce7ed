//! Error taxonomy for the reactive graph.
//!
//! Most of this system is panic-free by construction: a miss is a miss (`Option::None`), a
//! cancelled run is an internal sentinel that never surfaces. The two places user code can
//! actually fail are inside a `Computed`'s compute function or inside an `Effect`/`AsyncEffect`
//! body; those are caught at the boundary and routed to the handler installed by
//! [`set_effect_error_handler`] rather than unwinding into the caller that happened to trigger the
//! recompute.

use std::cell::RefCell;

use thiserror::Error;

/// Returned by [`crate::Computed::write`] and [`crate::Computed::update`]: computeds are
/// derivations, not state, and cannot be written to directly.
#[derive(Debug, Error)]
#[error("cannot write to a read-only computed value")]
pub struct ReadOnlyComputedError;

/// Errors returned by scope operations.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// `with_scope` was called on a scope that has already been disposed.
    #[error("cannot enter a scope after it has been disposed")]
    EnteredAfterDispose,
}

/// Where an [`EffectError`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Effect,
    Computed,
}

/// Carries a caught panic payload from an effect or computed run, tagged with its source so a
/// handler can decide how seriously to treat it.
#[derive(Error)]
#[error("{source:?} body panicked: {message}")]
pub struct EffectError {
    pub message: String,
    pub source: ErrorSource,
}

impl std::fmt::Debug for EffectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectError")
            .field("source", &self.source)
            .field("message", &self.message)
            .finish()
    }
}

impl EffectError {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>, source: ErrorSource) -> Self {
        Self {
            message: payload_message(&*payload),
            source,
        }
    }
}

type ErrorHandler = Box<dyn Fn(&EffectError)>;

thread_local! {
    static HANDLER: RefCell<Option<ErrorHandler>> = const { RefCell::new(None) };
}

/// Installs a global handler invoked whenever an effect or computed body panics. Only one handler
/// is active at a time; installing a new one replaces the previous.
///
/// If no handler is registered, errors are logged via `tracing::warn!` (when the `trace` feature
/// is enabled) and otherwise silently swallowed — the graph always stays consistent, with or
/// without a handler.
pub fn set_effect_error_handler(handler: impl Fn(&EffectError) + 'static) {
    HANDLER.with(|h| *h.borrow_mut() = Some(Box::new(handler)));
}

/// Removes any handler installed by [`set_effect_error_handler`].
pub fn clear_effect_error_handler() {
    HANDLER.with(|h| *h.borrow_mut() = None);
}

pub(crate) fn report(error: EffectError) {
    let handled = HANDLER.with(|h| {
        if let Some(handler) = h.borrow().as_ref() {
            handler(&error);
            true
        } else {
            false
        }
    });
    if !handled {
        #[cfg(feature = "trace")]
        tracing::warn!(source = ?error.source, message = %error.message, "unhandled reactive error");
        #[cfg(not(feature = "trace"))]
        let _ = error;
    }
}

/// Reports cleanup panics collected during one scope's dispose, per spec.md §7: "Scope cleanup
/// errors are collected per-scope and surfaced in aggregate at the end of dispose; they never
/// prevent remaining cleanups from running." There is no public error type for these (unlike
/// `EffectError`) since a cleanup panicking is not routed through `set_effect_error_handler` —
/// that hook is effect/computed-specific per spec.md §6.
pub(crate) fn report_scope_cleanup_errors(messages: &[String]) {
    if messages.is_empty() {
        return;
    }
    #[cfg(feature = "trace")]
    tracing::warn!(count = messages.len(), errors = ?messages, "scope cleanup(s) panicked during dispose");
    #[cfg(not(feature = "trace"))]
    let _ = messages;
}

/// Extracts a human-readable message from a caught panic payload. Shared by the effect/computed
/// boundary ([`EffectError::from_payload`]) and scope cleanup error isolation.
pub(crate) fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
