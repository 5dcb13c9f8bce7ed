//! [`Scope`]: a hierarchical lifetime container for reactive nodes.
//!
//! Built directly on `root.rs`'s child-scope primitive (the same one `create_child_scope` already
//! used internally), generalized into an addressable, copyable handle with its own
//! `with_scope`/`dispose`/`is_disposed` API and devtools-style lifecycle listeners.

use crate::error::ScopeError;
use crate::root::create_child_scope;
use crate::{NodeHandle, NodeId, Root};

/// A hierarchical lifetime container. Disposing a scope disposes every signal, computed, effect,
/// async effect, and child scope created while it was the current scope, in the order described by
/// [`Scope::dispose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope(pub(crate) NodeId);

/// Creates a new scope, parented under the current scope (or under `parent` if it is `Some`,
/// regardless of what the caller's current scope happens to be).
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_scope(parent: Option<Scope>) -> Scope {
    let root = Root::global();
    let Some(parent) = parent else {
        return Scope(create_child_scope(|| {}));
    };
    let prev_owner = root.current_owner.replace(parent.0);
    let prev_scope = root.active_scope.replace(Some(parent.0));
    let node = create_child_scope(|| {});
    root.active_scope.set(prev_scope);
    root.current_owner.set(prev_owner);
    Scope(node)
}

impl Scope {
    /// Runs `f` with this scope set as the current scope for the duration of the call, restoring
    /// the previous current scope on every exit path (including panics). Returns
    /// [`ScopeError::EnteredAfterDispose`] if the scope has already been disposed.
    pub fn with_scope<T>(self, f: impl FnOnce() -> T) -> Result<T, ScopeError> {
        if self.is_disposed() {
            return Err(ScopeError::EnteredAfterDispose);
        }
        let root = Root::global();
        let prev_owner = root.current_owner.replace(self.0);
        let prev_scope = root.active_scope.replace(Some(self.0));
        let ret = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        root.active_scope.set(prev_scope);
        root.current_owner.set(prev_owner);
        match ret {
            Ok(ret) => Ok(ret),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Registers `f` to run when this scope is disposed. If the scope is already disposed, `f`
    /// runs immediately instead (scope cleanups registered after dispose execute right away;
    /// this is distinct from `ScopeError::EnteredAfterDispose`, which only applies to
    /// `with_scope`). A panic from `f` in the immediate-run case is isolated the same way a panic
    /// during ordinary dispose is.
    pub fn on_cleanup(self, f: impl FnOnce() + 'static) {
        let root = Root::global();
        if let Some(n) = root.nodes.borrow_mut().get_mut(self.0) {
            n.cleanups.push(Box::new(f));
        } else if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            crate::error::report_scope_cleanup_errors(&[crate::error::payload_message(
                &*crate::root::unsend_payload(payload),
            )]);
        }
    }

    /// Disposes this scope: idempotent, marks disposed before running cleanups (so a cleanup that
    /// re-enters `dispose` is a no-op), runs cleanups in FIFO order, and disposes children (which
    /// includes any nested scopes, effects, async effects, and computed invalidators) first.
    pub fn dispose(self) {
        NodeHandle(self.0).dispose();
    }

    /// Returns `true` if this scope has already been disposed.
    pub fn is_disposed(self) -> bool {
        !NodeHandle(self.0).is_alive()
    }

    /// A handle to the root scope of the calling thread's reactive root.
    pub fn global() -> Scope {
        Scope(Root::global().root_node.get())
    }
}

/// The scope a ref-counting collaborator (`cache.rs`, `query_client.rs`'s `select`) should acquire
/// into, or `None` if nothing but the implicit root scope is current, i.e. "outside any scope".
/// Shared by both so they agree on what "no scope" means.
pub(crate) fn calling_scope() -> Option<Scope> {
    let root = Root::global();
    let current = root.current_owner.get();
    if current == root.root_node.get() {
        None
    } else {
        Some(Scope(current))
    }
}

/// Registers a listener invoked with the [`NodeId`] of every scope created from this point on, for
/// the lifetime of the current reactive root. Intended for devtools-style collaborators, not
/// application logic (there is no corresponding unsubscribe; the listener set is cleared only when
/// the root itself is recreated).
pub fn on_scope_created(listener: impl Fn(NodeId) + 'static) {
    Root::global()
        .scope_created_listeners
        .borrow_mut()
        .push(Box::new(listener));
}

/// Registers a listener invoked with the [`NodeId`] of every scope disposed from this point on.
/// See [`on_scope_created`].
pub fn on_scope_disposed(listener: impl Fn(NodeId) + 'static) {
    Root::global()
        .scope_disposed_listeners
        .borrow_mut()
        .push(Box::new(listener));
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn dispose_runs_cleanups_fifo() {
        let _ = create_root(|| {
            let order = create_signal(Vec::<i32>::new());
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    on_cleanup(move || order.update(|o| o.push(1)));
                    on_cleanup(move || order.update(|o| o.push(2)));
                })
                .unwrap();
            scope.dispose();
            assert_eq!(order.get_clone(), vec![1, 2]);
        });
    }

    #[test]
    fn dispose_is_idempotent() {
        let _ = create_root(|| {
            let calls = create_signal(0);
            let scope = create_scope(None);
            scope
                .with_scope(|| on_cleanup(move || calls.update(|c| *c += 1)))
                .unwrap();
            scope.dispose();
            scope.dispose();
            assert_eq!(calls.get(), 1);
        });
    }

    #[test]
    fn cleanup_after_dispose_runs_immediately() {
        let _ = create_root(|| {
            let scope = create_scope(None);
            scope.dispose();
            let ran = create_signal(false);
            scope.on_cleanup(move || ran.set(true));
            assert!(ran.get());
        });
    }

    #[test]
    fn with_scope_after_dispose_errors() {
        let _ = create_root(|| {
            let scope = create_scope(None);
            scope.dispose();
            assert!(matches!(
                scope.with_scope(|| ()),
                Err(ScopeError::EnteredAfterDispose)
            ));
        });
    }

    #[test]
    fn child_scope_disposed_with_parent() {
        let _ = create_root(|| {
            let parent = create_scope(None);
            let child = parent.with_scope(|| create_scope(None)).unwrap();
            parent.dispose();
            assert!(child.is_disposed());
        });
    }

    #[test]
    fn panicking_cleanup_does_not_skip_later_cleanups() {
        let _ = create_root(|| {
            let order = create_signal(Vec::<i32>::new());
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    on_cleanup(move || order.update(|o| o.push(1)));
                    on_cleanup(|| panic!("boom"));
                    on_cleanup(move || order.update(|o| o.push(3)));
                })
                .unwrap();
            scope.dispose();
            assert_eq!(order.get_clone(), vec![1, 3]);
        });
    }
}
