//! A fine-grained reactivity runtime: signals, computeds, effects, async effects, scopes, a
//! scheduler, and (behind the `resource` feature) a cancellable async resource primitive with a
//! keyed TTL/LRU/tag cache and a thin query-client layer on top.
//!
//! This is the substrate a UI framework layers declarative DOM binding, forms, and component
//! composition on top of; none of that lives here. What does:
//!
//! - [`Signal`]/[`ReadSignal`] — writable/read-only reactive cells (`signals.rs`).
//! - [`Computed`] — a lazily-recomputed, cached derivation (`memos.rs`).
//! - [`create_effect`]/[`create_effect_async`] — scheduled subscribers, the latter cancellable
//!   (`effects.rs`).
//! - [`Scope`] — a hierarchical lifetime container with FIFO cleanups (`scope.rs`).
//! - [`batch`]/[`untrack`]/the scheduler's microtask+frame queues (`scheduler.rs`, `root.rs`).
//! - [`Resource`]/[`ResourceCache`]/[`QueryClient`] — cancellable async fetch state, a keyed cache
//!   with TTL/LRU/tag invalidation, and a composition layer over both (`resource.rs`, `cache.rs`,
//!   `key.rs`, `query_client.rs`).
//!
//! # Tracking model
//!
//! Reading a signal/computed inside an effect or computed body subscribes it, subject to a
//! *scope guard*: a read only subscribes the currently active effect if that effect has no owning
//! scope, or its owning scope is the scope active at read time. This stops a long-lived effect
//! from accidentally capturing a dependency read through a short-lived nested scope's computed —
//! see [`root::Root::track`].
//!
//! # Error handling
//!
//! Most of this crate is panic-free by construction (a cache miss is `None`, a cancelled run is an
//! internal sentinel). The two places user code can fail — a `Computed`'s compute function, an
//! `Effect`/`AsyncEffect` body — are caught at that boundary and routed to
//! [`set_effect_error_handler`] instead of unwinding into whatever write happened to trigger the
//! rerun. See `error.rs`.

mod effects;
mod error;
mod memos;
mod node;
mod root;
mod scheduler;
mod scope;
mod signals;
mod utils;

#[cfg(feature = "resource")]
mod cache;
#[cfg(feature = "resource")]
mod key;
#[cfg(feature = "resource")]
mod query_client;
#[cfg(feature = "resource")]
mod resource;

pub(crate) use node::{NodeId, ReactiveNode};
pub use node::NodeHandle;

pub use effects::{create_effect, create_effect_async, CancelToken};
pub use error::{
    clear_effect_error_handler, set_effect_error_handler, EffectError, ErrorSource,
    ReadOnlyComputedError, ScopeError,
};
pub use memos::{create_computed, Computed};
pub use root::{batch, create_root, on_cleanup, untrack, use_current_scope, use_global_scope, RootHandle};
pub(crate) use root::Root;
pub use scheduler::{
    configure_scheduler, is_batching, queue_in_batch, run_frame_tasks, schedule_frame,
    schedule_microtask, time_slice, SchedulerConfig, TimeSliceContext,
};
#[cfg(test)]
pub(crate) use scheduler::drain_microtasks_for_test;
pub use scope::{create_scope, on_scope_created, on_scope_disposed, Scope};
pub use signals::{create_signal, ReadSignal, Signal, SignalUnsubscribe};
pub use utils::{derived, on, Accessor, Trackable};

#[cfg(feature = "resource")]
pub use cache::{CacheConfig, CacheEntryOptions, ResourceCache};
#[cfg(feature = "resource")]
pub use key::{Key, KeyPart};
#[cfg(feature = "resource")]
pub use query_client::{
    set_stale_timer, InfiniteQueryHandle, QueryClient, QueryHandle, QueryObserverUnsubscribe,
    QueryOptions, QueryState,
};
#[cfg(feature = "resource")]
pub use resource::{
    create_resource, create_resource_with_deps, set_task_spawner, Resource, ResourceOptions,
};
