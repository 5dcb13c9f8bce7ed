//! [`Computed`]: a lazily-recomputed, cached derivation over other signals/computeds.
//!
//! An eager memo recomputes synchronously, inline, the moment any tracked dependency writes, via a
//! DFS over its dependents. This crate's scheduler doesn't run an inline DFS for anything but a
//! computed's own invalidator (see `root.rs`'s `invoke_sync`), so a computed here is lazy instead:
//! writing a dependency only flips a `dirty` flag synchronously and schedules the computed's
//! *subscribers*; the computed itself only actually re-runs `compute_fn` the next time something
//! reads it. The `dirty` flag and the separate invalidator child node are what make that possible,
//! grounded in the same arena-of-nodes representation as `node.rs`.

use std::any::Any;
use std::marker::PhantomData;

use crate::error::{self, ErrorSource, ReadOnlyComputedError};
use crate::node::{NodeCallback, NodeKind};
use crate::root::unsend_payload;
use crate::{NodeHandle, NodeId, ReactiveNode, Root};

/// A cached, lazily-recomputed read-only derivation of other signals/computeds.
///
/// Reading a `Computed` (via [`Computed::get`]/[`Computed::with`]) subscribes the current
/// effect/computed, exactly like reading a [`crate::Signal`]. Unlike a signal, a `Computed` has no
/// value of its own to write: its value is always `compute_fn()` evaluated against whatever it
/// read the last time it was dirty and got recomputed.
///
/// ```
/// # use reactive_core::*;
/// # create_root(|| {
/// let state = create_signal(1);
/// let double = create_computed(move || state.get() * 2);
/// assert_eq!(double.get(), 2);
/// state.set(2);
/// assert_eq!(double.get(), 4);
/// # });
/// ```
pub struct Computed<T: 'static> {
    id: NodeId,
    /// The sync invalidator effect that owns this computed's actual dependency edges. A child of
    /// `id`, so it's disposed automatically when the computed is.
    invalidator: NodeId,
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// Creates a [`Computed`] that lazily recomputes `f` whenever a tracked dependency changes and it
/// is next read. `f` is not run at creation time — only on the first `get`/`peek`/`with` call (see
/// the laziness invariant on [`Computed::get`]).
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_computed<T: 'static>(mut f: impl FnMut() -> T + 'static) -> Computed<T> {
    let root = Root::global();
    let parent = root.current_owner.get();
    let id = root.nodes.borrow_mut().insert(ReactiveNode::new(
        NodeKind::Computed { dirty: true },
        parent,
        root.active_scope.get(),
    ));
    if !parent.is_null() {
        root.nodes.borrow_mut()[parent].children.push(id);
    }
    // The invalidator's `owning_scope` is always `None`: a computed's dependency edges belong to
    // the computed, independent of whichever scope happens to be current when it recomputes (see
    // `Computed::recompute_if_dirty`'s `Some(None)` scope override).
    let invalidator = root.nodes.borrow_mut().insert(ReactiveNode::new(
        NodeKind::Effect {
            sync: true,
            pending: false,
        },
        id,
        None,
    ));
    root.nodes.borrow_mut()[id].children.push(invalidator);
    root.nodes.borrow_mut()[id].callback = Some(NodeCallback::Compute(Box::new(move || {
        Box::new(f()) as Box<dyn Any>
    })));
    root.nodes.borrow_mut()[invalidator].callback = Some(NodeCallback::Effect(Box::new(move || {
        let root = Root::global();
        if let Some(n) = root.nodes.borrow_mut().get_mut(id) {
            if let NodeKind::Computed { dirty } = &mut n.kind {
                *dirty = true;
            }
        }
        root.notify(id);
    })));
    Computed {
        id,
        invalidator,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    }
}

impl<T> Computed<T> {
    fn get_disposed_panic_message(self) -> String {
        #[cfg(not(debug_assertions))]
        return "computed was disposed".to_string();
        #[cfg(debug_assertions)]
        return format!("computed was disposed. Created at {}", self.created_at);
    }

    /// Recomputes the cached value if dirty: tears down the invalidator's previous dependency
    /// edges, runs `compute_fn` with the invalidator as the active effect and the active scope
    /// forced to `None`, stores the result, and clears `dirty`. A no-op if not dirty.
    ///
    /// If `compute_fn` panics, the panic is caught and reported through the same
    /// [`crate::set_effect_error_handler`] hook as an effect body, tagged
    /// [`ErrorSource::Computed`]. The computed is left dirty so the next read retries, and the
    /// callback is restored either way so a single panicking run never bricks the computed.
    fn recompute_if_dirty(self) {
        let root = Root::global();
        let dirty = match root.nodes.borrow().get(self.id) {
            Some(n) => matches!(n.kind, NodeKind::Computed { dirty: true }),
            None => panic!("{}", self.get_disposed_panic_message()),
        };
        if !dirty {
            return;
        }
        let callback = root
            .nodes
            .borrow_mut()
            .get_mut(self.id)
            .and_then(|n| n.callback.take());
        let Some(NodeCallback::Compute(mut callback)) = callback else {
            return;
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            root.run_tracked(self.invalidator, Some(None), || callback())
        }));
        match result {
            Ok(value) => {
                let mut nodes = root.nodes.borrow_mut();
                if let Some(n) = nodes.get_mut(self.id) {
                    n.value = Some(value);
                    n.callback = Some(NodeCallback::Compute(callback));
                    if let NodeKind::Computed { dirty } = &mut n.kind {
                        *dirty = false;
                    }
                }
            }
            Err(payload) => {
                if let Some(n) = root.nodes.borrow_mut().get_mut(self.id) {
                    n.callback = Some(NodeCallback::Compute(callback));
                }
                error::report(error::EffectError::from_payload(
                    unsend_payload(payload),
                    ErrorSource::Computed,
                ));
            }
        }
    }

    fn with_value_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let root = Root::global();
        let nodes = root.nodes.borrow();
        let node = match nodes.get(self.id) {
            Some(node) => node,
            None => panic!("{}", self.get_disposed_panic_message()),
        };
        let value = node.value.as_ref().expect("computed not yet recomputed");
        f(value.downcast_ref().expect("wrong computed type"))
    }

    /// Records a read of this computed against the currently active effect/computed, subject to
    /// the same scope guard as [`crate::ReadSignal::track`].
    pub fn track(self) {
        Root::global().track(self.id);
    }

    /// Reads the cached value, subscribing the caller and recomputing first if dirty.
    ///
    /// **Laziness invariant**: for a computed with no active subscribers, writing any of its
    /// dependencies only marks it dirty — `compute_fn` is not invoked until the next `get`/`peek`.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.recompute_if_dirty();
        self.with_value_untracked(|v| *v)
    }

    /// Like [`Computed::get`] but clones the value instead of requiring [`Copy`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.recompute_if_dirty();
        self.with_value_untracked(Clone::clone)
    }

    /// Reads the cached value without subscribing the caller, recomputing first if dirty.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn peek(self) -> T
    where
        T: Copy,
    {
        self.recompute_if_dirty();
        self.with_value_untracked(|v| *v)
    }

    /// Like [`Computed::peek`] but clones the value instead of requiring [`Copy`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn peek_clone(self) -> T
    where
        T: Clone,
    {
        self.recompute_if_dirty();
        self.with_value_untracked(Clone::clone)
    }

    /// Runs `f` with a reference to the cached value, subscribing the caller like
    /// [`Computed::get`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.recompute_if_dirty();
        self.with_value_untracked(f)
    }

    /// Like [`Computed::with`] but without subscribing the caller.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.recompute_if_dirty();
        self.with_value_untracked(f)
    }

    /// Always fails: computeds are derivations, not state.
    pub fn write(self, _new: T) -> Result<(), ReadOnlyComputedError> {
        Err(ReadOnlyComputedError)
    }

    /// Always fails: computeds are derivations, not state.
    pub fn update(self, _f: impl FnOnce(&T) -> T) -> Result<(), ReadOnlyComputedError> {
        Err(ReadOnlyComputedError)
    }

    /// Returns `true` if this computed has not yet been disposed.
    pub fn is_alive(self) -> bool {
        Root::global().nodes.borrow().contains_key(self.id)
    }

    /// Disposes this computed and its internal invalidator.
    pub fn dispose(self) {
        NodeHandle(self.id).dispose();
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Computed<T> {}

impl<T: PartialEq> PartialEq for Computed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for Computed<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: std::fmt::Display> std::fmt::Display for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

impl<T: Clone> crate::utils::Accessor<T> for Computed<T> {
    fn value(&self) -> T {
        self.get_clone()
    }
}
impl<T> crate::utils::Trackable for Computed<T> {
    fn _track(&self) {
        self.track();
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn computed_is_lazy_and_cached() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let calls = create_signal(0);
            let double = create_computed(move || {
                calls.update_silent(|c| *c += 1);
                state.get() * 2
            });
            assert_eq!(calls.get_untracked(), 0); // not yet computed
            assert_eq!(double.get(), 0);
            assert_eq!(calls.get_untracked(), 1);
            let _ = double.get();
            let _ = double.get();
            assert_eq!(calls.get_untracked(), 1); // cached, no recompute
        });
    }

    #[test]
    fn computed_does_not_recompute_until_next_read() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let calls = create_signal(0);
            let double = create_computed(move || {
                calls.update_silent(|c| *c += 1);
                state.get() * 2
            });
            let _ = double.get();
            assert_eq!(calls.get_untracked(), 1);
            state.set(1);
            // writing a dependency only marks dirty; compute_fn does not run again yet.
            assert_eq!(calls.get_untracked(), 1);
            assert_eq!(double.get(), 2);
            assert_eq!(calls.get_untracked(), 2);
        });
    }

    #[test]
    fn computed_of_computed() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2);
            let quadruple = create_computed(move || double.get() * 2);
            assert_eq!(quadruple.get(), 4);
            state.set(2);
            assert_eq!(quadruple.get(), 8);
        });
    }

    #[test]
    fn computed_write_is_read_only() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2);
            assert!(double.write(10).is_err());
            assert!(double.update(|v| v + 1).is_err());
            assert_eq!(double.get(), 2);
        });
    }

    #[test]
    fn computed_disposed_with_scope() {
        let _ = create_root(|| {
            let counter = create_signal(0);
            let trigger = create_signal(());
            let scope = create_scope(None);
            let double = scope
                .with_scope(|| {
                    create_computed(move || {
                        trigger.track();
                        counter.update_silent(|c| *c += 1);
                        0
                    })
                })
                .unwrap();
            let _ = double.get();
            assert_eq!(counter.get_untracked(), 1);
            scope.dispose();
            assert!(!double.is_alive());
        });
    }

    #[test]
    fn panicking_compute_is_caught_and_retried_next_read() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let should_panic = create_signal(false);
            let reports = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
            let reports_handle = reports.clone();
            set_effect_error_handler(move |e| reports_handle.borrow_mut().push(e.message.clone()));

            let flaky = create_computed(move || {
                if should_panic.get() {
                    panic!("boom");
                }
                state.get() * 2
            });

            assert_eq!(flaky.get(), 2);
            assert!(reports.borrow().is_empty());

            should_panic.set(true);
            // compute_fn panics: caught and reported rather than propagating, the stale cached
            // value is kept, and the computed stays dirty so the next read retries instead of
            // permanently bricking on a missing callback.
            assert_eq!(flaky.get(), 2);
            assert_eq!(reports.borrow().len(), 1);

            should_panic.set(false);
            state.set(5);
            assert_eq!(flaky.get(), 10);
            assert_eq!(reports.borrow().len(), 1);

            clear_effect_error_handler();
        });
    }

    #[test]
    fn computed_scope_independence() {
        // A computed read inside one scope and later inside another has dependency edges that
        // belong to the computed's own invalidator, not either caller scope.
        let _ = create_root(|| {
            let state = create_signal(1);
            let double = create_computed(move || state.get() * 2);
            let a = create_scope(None);
            let b = create_scope(None);
            assert_eq!(a.with_scope(|| double.get()).unwrap(), 2);
            assert_eq!(b.with_scope(|| double.get()).unwrap(), 2);
            state.set(5);
            assert_eq!(double.get(), 10);
            a.dispose();
            b.dispose();
            // disposing either caller scope must not have torn down the computed's own edges.
            state.set(6);
            assert_eq!(double.get(), 12);
        });
    }
}
