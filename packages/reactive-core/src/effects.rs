//! Effects: scheduled side-effecting subscribers, plus their cancellable async variant.
//!
//! Unlike a memo that recomputes eagerly and inline on every dependency write, this crate's effects
//! are a distinct, separately-scheduled kind of node (see `node.rs`'s `NodeKind::Effect`): the
//! initial run, and every rerun after, goes through
//! [`crate::root::Root::schedule_effect`] rather than running inline — the initial run is scheduled
//! via microtask just like a rerun. Because nothing else runs between an effect being
//! scheduled and the scheduler's auto-drain (see `scheduler.rs`), that microtask turn is already
//! over by the time `create_effect` returns to the caller in ordinary, non-batched use — so this
//! still reads like an eager effect to straight-line code, while writes issued from inside another
//! effect's body correctly coalesce into the same drain pass instead of recursing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::node::{NodeCallback, NodeKind};
use crate::{NodeHandle, NodeId, ReactiveNode, Root};

/// Creates an effect that reruns whenever a signal/computed read during its previous run changes.
///
/// ```
/// # use reactive_core::*;
/// # create_root(|| {
/// let state = create_signal(0);
/// let double = create_signal(-1);
/// create_effect(move || double.set(state.get() * 2));
/// assert_eq!(double.get(), 0);
/// state.set(1);
/// assert_eq!(double.get(), 2);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect(mut f: impl FnMut() + 'static) -> NodeHandle {
    let root = Root::global();
    let parent = root.current_owner.get();
    let id = root.nodes.borrow_mut().insert(ReactiveNode::new(
        NodeKind::Effect {
            sync: false,
            pending: false,
        },
        parent,
        root.active_scope.get(),
    ));
    if !parent.is_null() {
        root.nodes.borrow_mut()[parent].children.push(id);
    }
    root.nodes.borrow_mut()[id].callback = Some(NodeCallback::Effect(Box::new(move || f())));
    root.schedule_effect(id);
    NodeHandle(id)
}

/// A per-run cancellation handle passed to an [`create_effect_async`] body.
///
/// Every rerun of the owning async effect gets a fresh token; the previous run's token is
/// cancelled (and any `on_cancel` callbacks registered on it fire) before the new run starts, and
/// again when the effect is disposed.
#[derive(Clone)]
pub struct CancelToken(Rc<CancelState>);

struct CancelState {
    cancelled: Cell<bool>,
    on_cancel: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl CancelToken {
    /// Builds a fresh, not-yet-cancelled token. `pub(crate)` rather than private: `query_client.rs`'s
    /// `InfiniteQueryHandle::fetch_next_page` needs one for each next-page fetch, independent of any
    /// owning effect's run (unlike every other `CancelToken` in this crate, which comes from an
    /// [`create_effect_async`] run).
    pub(crate) fn new() -> Self {
        Self(Rc::new(CancelState {
            cancelled: Cell::new(false),
            on_cancel: RefCell::new(Vec::new()),
        }))
    }

    /// Returns `true` if this run has been superseded by a rerun, or the owning effect disposed.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.get()
    }

    /// Registers `f` to run when this token is cancelled. If it's already cancelled, `f` runs
    /// immediately.
    pub fn on_cancel(&self, f: impl FnOnce() + 'static) {
        if self.0.cancelled.get() {
            f();
        } else {
            self.0.on_cancel.borrow_mut().push(Box::new(f));
        }
    }

    /// Cancels this token, running every `on_cancel` callback registered on it. Idempotent.
    ///
    /// Used internally (a fresh rerun cancels the previous run's token, via the node's own
    /// teardown-before-rerun path) and by [`crate::Resource::cancel`], which needs to cancel a
    /// specific in-flight run on demand without forcing a new one.
    pub fn cancel(&self) {
        if !self.0.cancelled.replace(true) {
            for f in self.0.on_cancel.borrow_mut().drain(..) {
                f();
            }
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Creates an effect whose body receives a [`CancelToken`] valid for that run only.
///
/// Reruns (triggered the same way as [`create_effect`]) cancel the previous run's token before
/// invoking the body again; disposing the returned handle cancels whatever token is current. The
/// body is still an ordinary synchronous closure — spawning an actual future and wiring its
/// completion/abort to this token (e.g. via `reactive-core-futures`'s `spawn_local_scoped`) is the
/// caller's job: an explicit cancel token, rather than relying on a thread-cancellation mechanism
/// this crate has no access to.
///
/// ```
/// # use reactive_core::*;
/// # create_root(|| {
/// let state = create_signal(0);
/// let cancelled_count = create_signal(0);
/// create_effect_async(move |token| {
///     state.track();
///     token.on_cancel(move || cancelled_count.update_silent(|c| *c += 1));
/// });
/// state.set(1); // cancels the first run's token, then runs again with a fresh one
/// assert_eq!(cancelled_count.get(), 1);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_effect_async(mut f: impl FnMut(CancelToken) + 'static) -> NodeHandle {
    let root = Root::global();
    let parent = root.current_owner.get();
    let id = root.nodes.borrow_mut().insert(ReactiveNode::new(
        NodeKind::Effect {
            sync: false,
            pending: false,
        },
        parent,
        root.active_scope.get(),
    ));
    if !parent.is_null() {
        root.nodes.borrow_mut()[parent].children.push(id);
    }
    root.nodes.borrow_mut()[id].callback = Some(NodeCallback::Effect(Box::new(move || {
        // Each run's previous-token cleanup piggybacks on the effect's own teardown-before-rerun
        // path (`NodeId::dispose_children_and_cleanups`, run by `run_scheduled_effect` right
        // before this callback) and its final-dispose path (the same function, called from
        // `NodeId::dispose`) — so registering a plain node cleanup here gives us both "abort
        // previous at start of each rerun" and "abort on dispose" for free.
        let token = CancelToken::new();
        let for_cleanup = token.clone();
        let root = Root::global();
        if let Some(n) = root.nodes.borrow_mut().get_mut(id) {
            n.cleanups.push(Box::new(move || for_cleanup.cancel()));
        }
        f(token);
    })));
    root.schedule_effect(id);
    NodeHandle(id)
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn effect_runs_on_creation_and_reruns_on_write() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_signal(-1);
            create_effect(move || double.set(state.get() * 2));
            assert_eq!(double.get(), 0);
            state.set(1);
            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 4);
        });
    }

    #[test]
    fn effect_with_explicit_dependencies() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let double = create_signal(-1);
            create_effect(on(state, move || double.set(state.get() * 2)));
            assert_eq!(double.get(), 0);
            state.set(1);
            assert_eq!(double.get(), 2);
        });
    }

    #[test]
    fn effect_tears_down_and_rebuilds_dependencies_each_run() {
        let _ = create_root(|| {
            let condition = create_signal(true);
            let state1 = create_signal(0);
            let state2 = create_signal(1);
            let counter = create_signal(0);
            create_effect(move || {
                counter.update_silent(|c| *c += 1);
                if condition.get() {
                    state1.track();
                } else {
                    state2.track();
                }
            });
            assert_eq!(counter.get_untracked(), 1);
            state1.set(1);
            assert_eq!(counter.get_untracked(), 2);
            state2.set(1);
            assert_eq!(counter.get_untracked(), 2); // not tracked
            condition.set(false);
            assert_eq!(counter.get_untracked(), 3);
            state1.set(2);
            assert_eq!(counter.get_untracked(), 3); // not tracked anymore
            state2.set(2);
            assert_eq!(counter.get_untracked(), 4);
        });
    }

    #[test]
    fn outer_effects_run_before_nested_effects_created_during_their_own_run() {
        let _ = create_root(|| {
            let trigger = create_signal(());
            let outer_counter = create_signal(0);
            let inner_counter = create_signal(0);
            create_effect(move || {
                trigger.track();
                outer_counter.update_silent(|c| *c += 1);
                create_effect(move || {
                    trigger.track();
                    inner_counter.update_silent(|c| *c += 1);
                });
            });
            assert_eq!(outer_counter.get_untracked(), 1);
            assert_eq!(inner_counter.get_untracked(), 1);
            trigger.set(());
            assert_eq!(outer_counter.get_untracked(), 2);
            assert_eq!(inner_counter.get_untracked(), 2);
        });
    }

    #[test]
    fn effect_disposed_with_scope() {
        let _ = create_root(|| {
            let counter = create_signal(0);
            let trigger = create_signal(());
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    create_effect(move || {
                        trigger.track();
                        counter.update_silent(|c| *c += 1);
                    });
                })
                .unwrap();
            assert_eq!(counter.get_untracked(), 1);
            trigger.set(());
            assert_eq!(counter.get_untracked(), 2);
            scope.dispose();
            trigger.set(());
            assert_eq!(counter.get_untracked(), 2);
        });
    }

    #[test]
    fn effect_dispose_handle_is_idempotent() {
        let _ = create_root(|| {
            let counter = create_signal(0);
            let trigger = create_signal(());
            let handle = create_effect(move || {
                trigger.track();
                counter.update_silent(|c| *c += 1);
            });
            assert_eq!(counter.get_untracked(), 1);
            handle.dispose();
            handle.dispose();
            trigger.set(());
            assert_eq!(counter.get_untracked(), 1);
        });
    }

    #[test]
    fn async_effect_cancels_previous_token_on_rerun() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let cancelled_count = create_signal(0);
            let seen_cancelled_at_start = create_signal(false);
            create_effect_async(move |token| {
                seen_cancelled_at_start.set(token.is_cancelled());
                state.track();
                token.on_cancel(move || cancelled_count.update_silent(|c| *c += 1));
            });
            assert_eq!(cancelled_count.get_untracked(), 0);
            assert!(!seen_cancelled_at_start.get());
            state.set(1);
            assert_eq!(cancelled_count.get_untracked(), 1);
            state.set(2);
            assert_eq!(cancelled_count.get_untracked(), 2);
        });
    }

    #[test]
    fn async_effect_cancels_on_dispose() {
        let _ = create_root(|| {
            let cancelled = create_signal(false);
            let handle = create_effect_async(move |token| {
                token.on_cancel(move || cancelled.set(true));
            });
            assert!(!cancelled.get());
            handle.dispose();
            assert!(cancelled.get());
        });
    }
}
