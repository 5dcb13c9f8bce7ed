//! Reactive signals.

use std::any::Any;
use std::cell::{Ref, RefMut};
use std::fmt;
use std::fmt::Formatter;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{AddAssign, Deref, DivAssign, MulAssign, RemAssign, SubAssign};

use crate::node::NodeKind;
use crate::{NodeHandle, NodeId, ReactiveNode, Root};

/// A read-only reactive value.
///
/// A `ReadSignal` can be obtained by dereferencing a [`Signal`] (every `Signal` is a `ReadSignal`
/// with additional write access) or is what a [`crate::Computed`] exposes directly.
pub struct ReadSignal<T: 'static> {
    pub(crate) id: NodeId,
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// A reactive value that can be read and written to. The writable analog of [`ReadSignal`].
pub struct Signal<T: 'static>(pub(crate) ReadSignal<T>);

/// Creates a new [`Signal`] holding `value`.
///
/// Signals are reactive cells: reading one inside an [`crate::Effect`] or [`crate::Computed`]
/// automatically subscribes that reader, so it re-runs/recomputes whenever the signal's value
/// changes.
///
/// ```
/// # use reactive_core::*;
/// # create_root(|| {
/// let count = create_signal(0);
/// assert_eq!(count.get(), 0);
/// count.set(1);
/// assert_eq!(count.get(), 1);
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_signal<T>(value: T) -> Signal<T> {
    let signal = create_empty_signal();
    signal.get_mut().value = Some(Box::new(value));
    signal
}

#[cfg_attr(debug_assertions, track_caller)]
pub(crate) fn create_empty_signal<T>() -> Signal<T> {
    let root = Root::global();
    let parent = root.current_owner.get();
    let id = root.nodes.borrow_mut().insert(ReactiveNode::new(
        NodeKind::Signal,
        parent,
        root.active_scope.get(),
    ));
    if !parent.is_null() {
        root.nodes.borrow_mut()[parent].children.push(id);
    }
    Signal(ReadSignal {
        id,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    })
}

/// Compares two values for "identity equality": `Object.is`-style comparison where NaN is
/// self-equal and floats compare bitwise. Falls back to `PartialEq` for every other type. Used by
/// [`Signal::set`]/[`Signal::update`] to short-circuit no-op writes.
fn identity_eq<T: PartialEq + 'static>(a: &T, b: &T) -> bool {
    let a_any: &dyn Any = a;
    let b_any: &dyn Any = b;
    if let (Some(a), Some(b)) = (a_any.downcast_ref::<f64>(), b_any.downcast_ref::<f64>()) {
        return a.to_bits() == b.to_bits();
    }
    if let (Some(a), Some(b)) = (a_any.downcast_ref::<f32>(), b_any.downcast_ref::<f32>()) {
        return a.to_bits() == b.to_bits();
    }
    a == b
}

impl<T> ReadSignal<T> {
    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn get_ref(self) -> Ref<'static, ReactiveNode> {
        Ref::map(Root::global().nodes.borrow(), |nodes| match nodes.get(self.id) {
            Some(node) => node,
            None => panic!("{}", self.get_disposed_panic_message()),
        })
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn get_mut(self) -> RefMut<'static, ReactiveNode> {
        RefMut::map(Root::global().nodes.borrow_mut(), |nodes| {
            match nodes.get_mut(self.id) {
                Some(node) => node,
                None => panic!("{}", self.get_disposed_panic_message()),
            }
        })
    }

    /// Returns `true` if the signal has not yet been disposed.
    pub fn is_alive(self) -> bool {
        Root::global().nodes.borrow().contains_key(self.id)
    }

    /// Disposes the signal. Accessing it afterwards panics.
    pub fn dispose(self) {
        NodeHandle(self.id).dispose();
    }

    fn get_disposed_panic_message(self) -> String {
        #[cfg(not(debug_assertions))]
        return "signal was disposed".to_string();
        #[cfg(debug_assertions)]
        return format!("signal was disposed. Created at {}", self.created_at);
    }

    /// Gets the value without subscribing the current effect/computed. See [`Signal::set`] for
    /// the subscribing counterpart.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Like [`ReadSignal::get_untracked`] but clones the value instead of requiring [`Copy`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Reads the signal's value, subscribing the currently active effect/computed (if any and if
    /// the scope guard allows it — see the crate-level docs on scope-guarded subscription).
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.get_untracked()
    }

    /// Like [`ReadSignal::get`] but clones the value instead of requiring [`Copy`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.get_clone_untracked()
    }

    /// Runs `f` with a reference to the value, without subscribing.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let node = self.get_ref();
        let value = node.value.as_ref().expect("signal value missing");
        f(value.downcast_ref().expect("wrong signal type"))
    }

    /// Runs `f` with a reference to the value, subscribing like [`ReadSignal::get`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_untracked(f)
    }

    /// Records a read of this signal against the currently active effect/computed, without
    /// returning a value. Useful for making dependencies explicit (see [`crate::on`]).
    pub fn track(self) {
        Root::global().track(self.id);
    }

    /// Registers a manual subscriber invoked whenever this signal is written, bypassing the
    /// scheduler entirely (it is not deduped, batched, or torn down/rebuilt like an effect).
    /// Returns an idempotent unsubscribe handle.
    pub fn on(self, callback: impl Fn() + 'static) -> SignalUnsubscribe {
        let root = Root::global();
        let sub_id = root.next_subscriber_id();
        self.get_mut()
            .manual_subscribers
            .push((sub_id, std::rc::Rc::new(callback)));
        SignalUnsubscribe {
            node: self.id,
            sub_id,
        }
    }
}

/// An idempotent handle returned by [`ReadSignal::on`].
#[derive(Clone, Copy)]
pub struct SignalUnsubscribe {
    node: NodeId,
    sub_id: u64,
}

impl SignalUnsubscribe {
    /// Removes the subscriber. Calling this more than once is a no-op.
    pub fn unsubscribe(self) {
        let root = Root::global();
        if let Some(n) = root.nodes.borrow_mut().get_mut(self.node) {
            n.manual_subscribers.retain(|(id, _)| *id != self.sub_id);
        }
    }
}

impl<T> Signal<T> {
    /// Sets a new value without notifying dependents. Rarely what you want; prefer [`Signal::set`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_silent(self, new: T) {
        self.replace_silent(new);
    }

    /// Sets a new value for the signal, notifying dependents unless it is identity-equal to the
    /// current value (see the crate-level docs on equal-value short-circuiting).
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T)
    where
        T: PartialEq,
    {
        self.replace(new);
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace_silent(self, new: T) -> T {
        self.update_silent(|val| std::mem::replace(val, new))
    }

    /// Like [`Signal::set`] but returns the previous value. Short-circuits like `set` when the
    /// previous and new value are identity-equal.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace(self, new: T) -> T
    where
        T: PartialEq,
    {
        let boxed = self.get_mut().value.take().expect("signal value missing");
        let old = *boxed.downcast::<T>().expect("wrong signal type");
        let changed = !identity_eq(&old, &new);
        self.get_mut().value = Some(Box::new(new));
        if changed {
            let root = Root::global();
            root.notify(self.0.id);
            root.scheduler.drain_if_idle(root);
        }
        old
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take_silent(self) -> T
    where
        T: Default,
    {
        self.replace_silent(T::default())
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take(self) -> T
    where
        T: Default + PartialEq,
    {
        self.replace(T::default())
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update_silent<U>(self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut value = self.get_mut().value.take().expect("signal value missing");
        let ret = f(value.downcast_mut().expect("wrong signal type"));
        self.get_mut().value = Some(value);
        ret
    }

    /// Updates the value in place via `f` and unconditionally notifies dependents. Unlike
    /// [`Signal::set`]/[`Signal::replace`], there is no identity-equal short-circuit here: an
    /// in-place mutation closure doesn't hand back the previous value to compare against without
    /// requiring `T: Clone`, so `update` always propagates. Prefer `set`/`replace` when you want
    /// the no-op-on-equal behavior.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update<U>(self, f: impl FnOnce(&mut T) -> U) -> U {
        let ret = self.update_silent(f);
        let root = Root::global();
        root.notify(self.0.id);
        root.scheduler.drain_if_idle(root);
        ret
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn_silent(self, f: impl FnOnce(&T) -> T) {
        self.update_silent(move |val| *val = f(val));
    }

    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_fn(self, f: impl FnOnce(&T) -> T) {
        self.update(move |val| *val = f(val));
    }

    /// Notifies this signal's dependents without changing its value. Useful after a
    /// [`Signal::set_silent`]/[`Signal::update_silent`] write when the caller wants to defer or
    /// batch the decision to notify (see `resource.rs`'s state-machine signals, which write with
    /// `T: Clone` but no `PartialEq` bound and notify once per settled run instead).
    pub fn notify(self) {
        let root = Root::global();
        root.notify(self.0.id);
        root.scheduler.drain_if_idle(root);
    }

    /// Splits into a read-only handle and a plain setter closure, handy for passing to callbacks
    /// that only need to write.
    pub fn split(self) -> (ReadSignal<T>, impl Fn(T) -> T)
    where
        T: PartialEq,
    {
        (*self, move |value| {
            self.replace(value);
        })
    }
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Signal<T> {}

impl<T: Default> Default for ReadSignal<T> {
    fn default() -> Self {
        *create_signal(Default::default())
    }
}
impl<T: Default> Default for Signal<T> {
    fn default() -> Self {
        create_signal(Default::default())
    }
}

impl<T: PartialEq> PartialEq for ReadSignal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for ReadSignal<T> {}
impl<T: PartialOrd> PartialOrd for ReadSignal<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.with(|value| other.with(|other| value.partial_cmp(other)))
    }
}
impl<T: Ord> Ord for ReadSignal<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.with(|value| other.with(|other| value.cmp(other)))
    }
}
impl<T: Hash> Hash for ReadSignal<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T: PartialEq> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T: Eq> Eq for Signal<T> {}

impl<T> Deref for Signal<T> {
    type Target = ReadSignal<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for ReadSignal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Signal<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for ReadSignal<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de>> serde::Deserialize<'de> for ReadSignal<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(*create_signal(T::deserialize(deserializer)?))
    }
}

impl<T: AddAssign<Rhs> + PartialEq, Rhs> AddAssign<Rhs> for Signal<T> {
    fn add_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this += rhs);
    }
}
impl<T: SubAssign<Rhs> + PartialEq, Rhs> SubAssign<Rhs> for Signal<T> {
    fn sub_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this -= rhs);
    }
}
impl<T: MulAssign<Rhs> + PartialEq, Rhs> MulAssign<Rhs> for Signal<T> {
    fn mul_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this *= rhs);
    }
}
impl<T: DivAssign<Rhs> + PartialEq, Rhs> DivAssign<Rhs> for Signal<T> {
    fn div_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this /= rhs);
    }
}
impl<T: RemAssign<Rhs> + PartialEq, Rhs> RemAssign<Rhs> for Signal<T> {
    fn rem_assign(&mut self, rhs: Rhs) {
        self.update(|this| *this %= rhs);
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn signal() {
        let _ = create_root(|| {
            let state = create_signal(0);
            assert_eq!(state.get(), 0);
            state.set(1);
            assert_eq!(state.get(), 1);
            state.set_fn(|n| *n + 1);
            assert_eq!(state.get(), 2);
        });
    }

    #[test]
    fn set_silent_does_not_notify() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let runs = create_signal(0);
            create_effect(move || {
                state.track();
                runs.update_silent(|r| *r += 1);
            });
            drain_microtasks_for_test();
            assert_eq!(runs.get_untracked(), 1);
            state.set_silent(1);
            assert_eq!(runs.get_untracked(), 1);
        });
    }

    #[test]
    fn identity_equal_write_is_noop() {
        let _ = create_root(|| {
            let state = create_signal(1.0_f64);
            let runs = create_signal(0);
            create_effect(move || {
                state.track();
                runs.update_silent(|r| *r += 1);
            });
            drain_microtasks_for_test();
            assert_eq!(runs.get_untracked(), 1);
            state.set(1.0);
            drain_microtasks_for_test();
            assert_eq!(runs.get_untracked(), 1);
            state.set(2.0);
            drain_microtasks_for_test();
            assert_eq!(runs.get_untracked(), 2);
        });
    }

    #[test]
    fn nan_is_self_equal() {
        let _ = create_root(|| {
            let state = create_signal(f64::NAN);
            let runs = create_signal(0);
            create_effect(move || {
                state.track();
                runs.update_silent(|r| *r += 1);
            });
            drain_microtasks_for_test();
            state.set(f64::NAN);
            drain_microtasks_for_test();
            assert_eq!(runs.get_untracked(), 1);
        });
    }

    #[test]
    fn manual_subscriber_on() {
        let _ = create_root(|| {
            let state = create_signal(0);
            let calls = create_signal(0);
            let unsub = state.on(move || calls.update_silent(|c| *c += 1));
            state.set(1);
            assert_eq!(calls.get_untracked(), 1);
            unsub.unsubscribe();
            state.set(2);
            assert_eq!(calls.get_untracked(), 1);
        });
    }
}
