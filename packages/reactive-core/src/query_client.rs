//! [`QueryClient`]: a thin, composition-only layer binding [`crate::Resource`] + [`ResourceCache`]
//! to a *reactive* key.
//!
//! Grounded on the same `other_examples/…ifiokjr-leptoskit…query_client.rs.rs`/`…patr-cloud-leptos-query…
//! query_executor.rs.rs` pair `cache.rs` is grounded on, but this module adds nothing to the graph
//! or the cache itself — every operation here is a direct call into [`crate::Computed`],
//! [`crate::create_effect`], or `ResourceCache`'s own methods, wired together declaratively rather
//! than by hand.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cache::{CacheEntryOptions, ResourceCache};
use crate::effects::{create_effect_async, CancelToken};
use crate::key::{EncodedKey, Key};
use crate::memos::{create_computed, Computed};
use crate::resource::{Resource, ResourceOptions};
use crate::root::on_cleanup;
use crate::scope::{create_scope, Scope};
use crate::signals::{create_signal, Signal, SignalUnsubscribe};

type DelayFn = Rc<dyn Fn(u64, Box<dyn FnOnce()>)>;

thread_local! {
    static STALE_TIMER: RefCell<Option<DelayFn>> = const { RefCell::new(None) };
}

/// Installs the function used to schedule a `staleTime`- or `refreshInterval`-driven background
/// refresh (see [`QueryOptions::stale_time_ms`]/[`QueryOptions::refresh_interval_ms`]). Intended
/// for a host integration to call once at startup with a real timer (e.g. backed by
/// `tokio::time::sleep` or `setTimeout`); without one installed, both options are accepted but
/// never fire (a `tracing::warn!` fires once per call, behind the `trace` feature) since this
/// crate has no ambient timer of its own (spec.md §5's "timeouts are not provided by the core").
pub fn set_stale_timer(f: impl Fn(u64, Box<dyn FnOnce()>) + 'static) {
    STALE_TIMER.with(|cell| *cell.borrow_mut() = Some(Rc::new(f)));
}

fn schedule_after(delay_ms: u64, callback: impl FnOnce() + 'static) {
    let installed = STALE_TIMER.with(|cell| cell.borrow().clone());
    match installed {
        Some(f) => f(delay_ms, Box::new(callback)),
        None => {
            #[cfg(feature = "trace")]
            tracing::warn!(delay_ms, "stale-time refresh requested but no timer is installed via set_stale_timer; ignoring");
        }
    }
}

/// Options recognized by [`QueryClient::query`]/[`QueryClient::query_global`].
pub struct QueryOptions<T, E> {
    pub ttl_ms: Option<u64>,
    pub tags: Vec<String>,
    pub persist: bool,
    /// After each successful fetch, schedules a `refresh(force: false)` this many milliseconds
    /// later — guarded so a timer scheduled against one key's resource can never fire against a
    /// later key's (see [`QueryClient::query`]'s module-level doc comment on how that guard works).
    /// Requires [`set_stale_timer`] to have installed a real timer, and a live [`crate::Scope`] at
    /// the point of the success (so the guard has something to tear down when the key changes).
    pub stale_time_ms: Option<u64>,
    /// Unconditionally re-runs `refresh(force: true)` every this-many milliseconds for as long as
    /// this key stays current, independent of whether the data has been read or is stale. Unlike
    /// `stale_time_ms` (a one-shot timer reset on every successful fetch, which only matters once
    /// something actually re-subscribes), this is a continuous poll — the same `set_stale_timer`
    /// host hook drives both. Requires a live [`crate::Scope`] at the point of creation, same as
    /// `stale_time_ms`.
    pub refresh_interval_ms: Option<u64>,
    pub resource: ResourceOptions<T, E>,
}

impl<T, E> Default for QueryOptions<T, E> {
    fn default() -> Self {
        Self {
            ttl_ms: None,
            tags: Vec::new(),
            persist: false,
            stale_time_ms: None,
            refresh_interval_ms: None,
            resource: ResourceOptions::default(),
        }
    }
}

/// Reschedules itself every `interval_ms` for as long as `active` holds, firing
/// `resource.refresh(true)` (fire-and-forget, matching the `stale_time_ms` refresh above) on each
/// tick. Self-reference is via a shared `Rc<RefCell<Option<Rc<dyn Fn()>>>>` cell since a plain
/// closure can't recurse into itself by name.
fn schedule_recurring_refresh<T, E>(
    resource: Resource<T, E>,
    active: Rc<Cell<bool>>,
    interval_ms: u64,
) where
    T: Clone + 'static,
    E: Clone + 'static,
{
    let tick: Rc<RefCell<Option<Rc<dyn Fn()>>>> = Rc::new(RefCell::new(None));
    let tick_for_body = tick.clone();
    *tick.borrow_mut() = Some(Rc::new(move || {
        if !active.get() {
            return;
        }
        let _ = resource.refresh(true);
        let tick_next = tick_for_body.clone();
        schedule_after(interval_ms, move || {
            if let Some(f) = tick_next.borrow().clone() {
                f();
            }
        });
    }));
    let first = tick.borrow().clone().expect("just set above");
    schedule_after(interval_ms, move || first());
}

/// A key-reactive handle to a cached [`Resource`]: [`QueryClient::query`]'s return value.
///
/// Wraps a `Computed<Resource<T, E>>` so that a reactive `key_fn` recreates (or re-acquires) the
/// underlying cache entry whenever the key changes, plus a keep-alive [`crate::Effect`] that forces
/// that recomputation to happen even if nobody ever reads [`QueryHandle::data`] (see spec.md §4.9's
/// "an effect re-reads the computed to ensure key changes propagate even if nobody reads data() yet").
pub struct QueryHandle<T: 'static, E: 'static> {
    resource: Computed<Resource<T, E>>,
    _keep_alive: crate::NodeHandle,
}

impl<T: Clone + 'static, E: Clone + 'static> QueryHandle<T, E> {
    /// The underlying [`Resource`] for whatever key is current right now.
    pub fn resource(&self) -> Resource<T, E> {
        self.resource.get_clone()
    }
    pub fn data(&self) -> Option<T> {
        self.resource.get_clone().data.get_clone()
    }
    pub fn loading(&self) -> bool {
        self.resource.get_clone().loading.get()
    }
    pub fn fetching(&self) -> bool {
        self.resource.get_clone().fetching.get()
    }
    pub fn error(&self) -> Option<E> {
        self.resource.get_clone().error.get_clone()
    }
    pub fn refresh(&self, force: bool) -> impl Future<Output = ()> + 'static {
        self.resource.peek_clone().refresh(force)
    }
    pub fn cancel(&self) {
        self.resource.peek_clone().cancel();
    }
}

impl<T, E> Clone for QueryHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource,
            _keep_alive: self._keep_alive,
        }
    }
}

/// A snapshot of a [`Resource`]'s state, as delivered to an [`QueryClient::observe_query`] listener.
#[derive(Clone)]
pub struct QueryState<T, E> {
    pub data: Option<T>,
    pub loading: bool,
    pub fetching: bool,
    pub error: Option<E>,
}

/// The combined unsubscribe handle returned by [`QueryClient::observe_query`] (it listens across
/// all four of a resource's signals, so unsubscribing has to undo all four).
pub struct QueryObserverUnsubscribe {
    handles: Vec<SignalUnsubscribe>,
}

impl QueryObserverUnsubscribe {
    pub fn unsubscribe(self) {
        for handle in self.handles {
            handle.unsubscribe();
        }
    }
}

struct SelectEntry {
    computed: Box<dyn std::any::Any>,
    scope: Scope,
    ref_count: Cell<u32>,
}

/// Composition-only layer over a [`ResourceCache`]: binds cached resources to reactive keys and
/// adds query-shaped conveniences (selectors, observers, infinite pagination) on top. Holds no
/// reactive state of its own beyond the `select` memoization registry — everything else is a plain
/// method call into `cache`, `Computed`, or `Resource`.
pub struct QueryClient {
    pub cache: Rc<ResourceCache>,
    /// `select`'s `(key, selector_id) -> shared Computed` registry (spec.md §4.9: "`select` returns
    /// a computed memoized by `(encoded_key, selector_identity)`; ref-counted"). Rust closures
    /// aren't comparable, so `selector_identity` is a caller-supplied string id rather than a
    /// function-identity check — documented on [`QueryClient::select`].
    selectors: RefCell<FxHashMap<(EncodedKey, String), SelectEntry>>,
    /// One ref per (scope, dedup_key) pair, mirroring `cache.rs`'s `PerScopeKeyMap` so a scope
    /// calling `select` twice for the same `(key, selector_id)` acquires only once and releases
    /// exactly once on its own cleanup.
    per_scope: RefCell<FxHashMap<Scope, FxHashSet<(EncodedKey, String)>>>,
}

impl QueryClient {
    /// Creates a `QueryClient` over a fresh, empty [`ResourceCache`].
    pub fn new() -> Rc<Self> {
        Self::with_cache(ResourceCache::new())
    }

    /// Creates a `QueryClient` over an existing cache (e.g. one shared with other collaborators).
    pub fn with_cache(cache: Rc<ResourceCache>) -> Rc<Self> {
        Rc::new(Self {
            cache,
            selectors: RefCell::new(FxHashMap::default()),
            per_scope: RefCell::new(FxHashMap::default()),
        })
    }

    /// Binds `fetch_fn` to a reactive key: `key_fn` is tracked inside a [`crate::Computed`], so
    /// changing the key it returns swaps to a different (or freshly created) cache entry on the
    /// next recompute, which a keep-alive effect forces to happen eagerly rather than waiting for
    /// someone to read [`QueryHandle::data`].
    ///
    /// Requires a live [`crate::Scope`] to be current, exactly like [`ResourceCache::create`] — a
    /// query created outside any scope without `options.persist` returns a perfectly functional but
    /// uncached, unshared resource per key change (see [`ResourceCache`]'s "safe-by-default" note).
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn query<K, T, E, Fut>(
        self: &Rc<Self>,
        key_fn: impl Fn() -> K + 'static,
        fetch_fn: impl Fn(K, CancelToken) -> Fut + 'static,
        mut options: QueryOptions<T, E>,
    ) -> QueryHandle<T, E>
    where
        K: Into<Key> + Clone + 'static,
        T: Clone + 'static,
        E: Clone + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
    {
        let cache = self.cache.clone();
        let fetch_fn = Rc::new(fetch_fn);
        let ttl_ms = options.ttl_ms;
        let tags = std::mem::take(&mut options.tags);
        let persist = options.persist;
        let stale_time_ms = options.stale_time_ms;
        let refresh_interval_ms = options.refresh_interval_ms;
        // Owns the per-key `staleTime`/`refreshInterval` subscriptions (see below); disposed and
        // replaced at the start of every recompute, so neither ever outlives the key it was set up
        // for.
        let timer_scope: Rc<Cell<Option<Scope>>> = Rc::new(Cell::new(None));

        let resource_computed = create_computed(move || {
            if let Some(previous) = timer_scope.take() {
                previous.dispose();
            }
            let key = key_fn();
            let fetch_fn = fetch_fn.clone();
            let resource = cache.create(
                key.clone(),
                move |token| (fetch_fn)(key.clone(), token),
                CacheEntryOptions {
                    ttl_ms,
                    tags: tags.clone(),
                    persist,
                    warn_if_no_scope: true,
                    resource: ResourceOptions::default(),
                },
            );
            if stale_time_ms.is_some() || refresh_interval_ms.is_some() {
                let scope = create_scope(None);
                let active = Rc::new(Cell::new(true));
                scope
                    .with_scope(|| {
                        let active_for_cleanup = active.clone();
                        on_cleanup(move || active_for_cleanup.set(false));
                        if let Some(stale_time_ms) = stale_time_ms {
                            let resource_for_sub = resource.clone();
                            let active_for_sub = active.clone();
                            let unsub = resource_for_sub.data.on(move || {
                                let resource = resource_for_sub.clone();
                                let active = active_for_sub.clone();
                                schedule_after(stale_time_ms, move || {
                                    // The guard: if this query has since moved on to a different
                                    // key, the scope (and `active`) were torn down at the top of
                                    // the next recompute above, before this callback runs.
                                    if active.get() {
                                        let _ = resource.refresh(false);
                                    }
                                });
                            });
                            on_cleanup(move || unsub.unsubscribe());
                        }
                        if let Some(refresh_interval_ms) = refresh_interval_ms {
                            schedule_recurring_refresh(
                                resource.clone(),
                                active.clone(),
                                refresh_interval_ms,
                            );
                        }
                    })
                    .expect("freshly created scope cannot already be disposed");
                timer_scope.set(Some(scope));
            }
            resource
        });

        let keep_alive = crate::effects::create_effect(move || {
            // `get_clone` (not `track`) so the recompute this is meant to force actually happens,
            // not just gets subscribed to.
            resource_computed.get_clone();
        });

        QueryHandle {
            resource: resource_computed,
            _keep_alive: keep_alive,
        }
    }

    /// Like [`Self::query`], but forces `persist = true` regardless of what `options` says — for
    /// app-wide singleton queries meant to outlive any particular component/caller scope.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn query_global<K, T, E, Fut>(
        self: &Rc<Self>,
        key_fn: impl Fn() -> K + 'static,
        fetch_fn: impl Fn(K, CancelToken) -> Fut + 'static,
        mut options: QueryOptions<T, E>,
    ) -> QueryHandle<T, E>
    where
        K: Into<Key> + Clone + 'static,
        T: Clone + 'static,
        E: Clone + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
    {
        options.persist = true;
        self.query(key_fn, fetch_fn, options)
    }

    /// Eagerly warms a cache entry for `key` without returning a handle — fire-and-forget, used to
    /// start a fetch before whatever will eventually read it mounts. Requires a live scope or
    /// `options.persist`, exactly like [`Self::query`]; a no-op beyond the fetch itself if neither
    /// holds (the returned resource is simply dropped).
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn prefetch_query<K, T, E, Fut>(
        self: &Rc<Self>,
        key: K,
        fetch_fn: impl Fn(CancelToken) -> Fut + 'static,
        options: CacheEntryOptions<T, E>,
    ) where
        K: Into<Key>,
        T: Clone + 'static,
        E: Clone + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
    {
        let _ = self.cache.create(key, fetch_fn, options);
    }

    pub fn get_query_data<T: Clone + 'static, E: 'static>(&self, key: impl Into<Key>) -> Option<T> {
        self.cache.get_data::<T, E>(key)
    }

    pub fn set_query_data<T: Clone + 'static, E: 'static>(&self, key: impl Into<Key>, value: T) {
        self.cache.set_data::<T, E>(key, value);
    }

    pub fn invalidate_key(&self, key: impl Into<Key>, revalidate: bool, force: bool) {
        self.cache.invalidate(key, revalidate, force);
    }

    pub fn invalidate_tag(&self, tag: &str, revalidate: bool, force: bool) {
        self.cache.invalidate_tag(tag, revalidate, force);
    }

    pub fn invalidate_tags(&self, tags: &[String], revalidate: bool, force: bool) {
        self.cache.invalidate_tags(tags, revalidate, force);
    }

    /// Cancels the in-flight run of every key in `keys`, without needing to know each key's `T`/`E`
    /// (see [`ResourceCache::cancel_erased`]).
    pub fn cancel_queries(&self, keys: impl IntoIterator<Item = impl Into<Key>>) {
        for key in keys {
            self.cache.cancel_erased(key);
        }
    }

    /// Forces a revalidating refresh of every key in `keys`.
    pub fn refetch_queries(&self, keys: impl IntoIterator<Item = impl Into<Key>>) {
        for key in keys {
            self.cache.invalidate(key, true, true);
        }
    }

    /// Every currently-cached key whose encoded string form matches `predicate`.
    pub fn find_queries(&self, predicate: impl Fn(&str) -> bool) -> Vec<EncodedKey> {
        self.cache
            .keys()
            .into_iter()
            .filter(|key| predicate(key.as_str()))
            .collect()
    }

    /// A memoized derivation of `key`'s cached resource, shared across every caller that passes the
    /// same `(key, selector_id)` pair and ref-counted so the shared `Computed` is torn down once no
    /// caller's scope still references it (spec.md §4.9). `selector_id` stands in for "selector
    /// identity" — Rust closures have no function-identity equality, so callers name their selector
    /// (e.g. `"user.display_name"`) instead of relying on the closure value itself.
    ///
    /// Requires `key`'s entry to already be cached (created via [`Self::query`]/[`Self::prefetch_query`]
    /// /[`ResourceCache::create`]); returns `None` if it isn't.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn select<T, U, E>(
        self: &Rc<Self>,
        key: impl Into<Key>,
        selector_id: impl Into<String>,
        selector: impl Fn(&Resource<T, E>) -> U + 'static,
    ) -> Option<Computed<U>>
    where
        T: Clone + 'static,
        U: Clone + 'static,
        E: Clone + 'static,
    {
        let encoded = key.into().encode();
        let selector_id = selector_id.into();
        let dedup_key = (encoded.clone(), selector_id);

        if let Some(entry) = self.selectors.borrow().get(&dedup_key) {
            let computed = entry
                .computed
                .downcast_ref::<Computed<U>>()
                .expect("select called twice for the same (key, selector_id) with a different output type");
            self.acquire_selector(&dedup_key, entry);
            return Some(*computed);
        }

        let resource = self.cache.resource_of::<T, E>(&encoded)?;
        let scope = create_scope(None);
        let computed = scope
            .with_scope(|| create_computed(move || selector(&resource)))
            .expect("freshly created scope cannot already be disposed");
        let entry = SelectEntry {
            computed: Box::new(computed),
            scope,
            ref_count: Cell::new(0),
        };
        self.selectors.borrow_mut().insert(dedup_key.clone(), entry);
        let entries = self.selectors.borrow();
        let entry = entries.get(&dedup_key).unwrap();
        self.acquire_selector(&dedup_key, entry);
        Some(computed)
    }

    /// Acquires a ref on `dedup_key` for the calling scope, mirroring `cache.rs`'s `acquire`: a
    /// scope that calls `select` twice for the same `(key, selector_id)` only takes one ref (so
    /// disposing that scope once releases it once), and a scope with nothing live beyond the
    /// implicit root scope takes no ref at all and never registers a cleanup (the caller is
    /// responsible for its own lifetime in that case, same as an unscoped `ResourceCache::create`).
    fn acquire_selector(self: &Rc<Self>, dedup_key: &(EncodedKey, String), entry: &SelectEntry) {
        let Some(scope) = crate::scope::calling_scope() else {
            return;
        };
        let mut per_scope = self.per_scope.borrow_mut();
        let first_acquisition_for_scope = !per_scope.contains_key(&scope);
        let keys = per_scope.entry(scope).or_default();
        let already_held = keys.contains(dedup_key);
        keys.insert(dedup_key.clone());
        if !already_held {
            entry.ref_count.set(entry.ref_count.get() + 1);
        }
        drop(per_scope);
        if first_acquisition_for_scope {
            let client = self.clone();
            scope.on_cleanup(move || client.release_scope(scope));
        }
    }

    /// Releases every `select` ref a now-disposed `scope` was holding.
    fn release_scope(&self, scope: Scope) {
        let Some(dedup_keys) = self.per_scope.borrow_mut().remove(&scope) else {
            return;
        };
        for dedup_key in dedup_keys {
            self.release_selector(&dedup_key);
        }
    }

    fn release_selector(&self, dedup_key: &(EncodedKey, String)) {
        let should_remove = {
            let entries = self.selectors.borrow();
            let Some(entry) = entries.get(dedup_key) else {
                return;
            };
            let remaining = entry.ref_count.get().saturating_sub(1);
            entry.ref_count.set(remaining);
            remaining == 0
        };
        if should_remove {
            if let Some(entry) = self.selectors.borrow_mut().remove(dedup_key) {
                entry.scope.dispose();
            }
        }
    }

    /// Registers `listener` to run whenever any of `handle`'s four signals (`data`/`loading`/
    /// `fetching`/`error`) changes, bypassing the scheduler (like [`crate::ReadSignal::on`]) rather
    /// than going through an effect. If `immediate`, `listener` also runs once immediately with the
    /// current snapshot.
    pub fn observe_query<T: Clone + 'static, E: Clone + 'static>(
        &self,
        handle: &QueryHandle<T, E>,
        listener: impl Fn(QueryState<T, E>) + 'static,
        immediate: bool,
    ) -> QueryObserverUnsubscribe {
        let resource = handle.resource.peek_clone();
        let listener = Rc::new(listener);
        let snapshot = {
            let resource = resource.clone();
            move || QueryState {
                data: resource.data.get_clone_untracked(),
                loading: resource.loading.get_untracked(),
                fetching: resource.fetching.get_untracked(),
                error: resource.error.get_clone_untracked(),
            }
        };
        if immediate {
            listener(snapshot());
        }
        let mut handles = Vec::with_capacity(4);
        {
            let listener = listener.clone();
            let snapshot = snapshot.clone();
            handles.push(resource.data.on(move || listener(snapshot())));
        }
        {
            let listener = listener.clone();
            let snapshot = snapshot.clone();
            handles.push(resource.loading.on(move || listener(snapshot())));
        }
        {
            let listener = listener.clone();
            let snapshot = snapshot.clone();
            handles.push(resource.fetching.on(move || listener(snapshot())));
        }
        {
            let listener = listener.clone();
            handles.push(resource.error.on(move || listener(snapshot())));
        }
        QueryObserverUnsubscribe { handles }
    }

    /// Creates an [`InfiniteQueryHandle`]: a paginated resource maintaining parallel `pages`/
    /// `page_params` arrays, with [`InfiniteQueryHandle::fetch_next_page`] appending the next page
    /// atomically (both arrays updated together, with no intervening await) and aborting any
    /// in-flight next-page fetch if the key changes out from under it.
    ///
    /// `track_key` is a plain tracking closure (e.g. `move || { some_signal.track(); }`) rather
    /// than a `Key`-returning one: unlike [`Self::query`], an infinite query has no cache entry to
    /// key into — "the key changed" only needs to reset the page state, not re-encode anything.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn infinite_query<T, P, E, Fut>(
        self: &Rc<Self>,
        track_key: impl Fn() + 'static,
        fetch_page: impl Fn(P, CancelToken) -> Fut + 'static,
        get_next_page_param: impl Fn(&[T], &[P]) -> Option<P> + 'static,
        initial_page_param: P,
    ) -> InfiniteQueryHandle<T, P, E>
    where
        T: Clone + 'static,
        P: Clone + 'static,
        E: Clone + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
    {
        let pages: Signal<Vec<T>> = create_signal(Vec::new());
        let page_params: Signal<Vec<P>> = create_signal(Vec::new());
        let loading = create_signal(false);
        let error: Signal<Option<E>> = create_signal(None);
        let current_token: Rc<RefCell<Option<CancelToken>>> = Rc::new(RefCell::new(None));

        // `fetch_page` is generic over its own future type (`Fut`), but the handle stores a single
        // boxed-trait-object fn so `InfiniteQueryHandle<T, P, E>` doesn't carry that type parameter
        // around; box each call's future here, once, at the seam.
        let fetch_page: Rc<dyn Fn(P, CancelToken) -> Pin<Box<dyn Future<Output = Result<T, E>>>>> = {
            let fetch_page = Rc::new(fetch_page);
            Rc::new(move |param, token| Box::pin(fetch_page(param, token)) as Pin<Box<dyn Future<Output = Result<T, E>>>>)
        };

        // Resets pages/page_params/error whenever the reactive key changes, and aborts whatever
        // next-page fetch was in flight for the previous key.
        let current_token_for_driver = current_token.clone();
        create_effect_async(move |token| {
            track_key();
            if let Some(previous) = current_token_for_driver.borrow_mut().replace(token) {
                previous.cancel();
            }
            pages.set_silent(Vec::new());
            pages.notify();
            page_params.set_silent(Vec::new());
            page_params.notify();
            error.set_silent(None);
            error.notify();
        });

        InfiniteQueryHandle {
            pages,
            page_params,
            loading,
            error,
            fetch_page,
            get_next_page_param: Rc::new(get_next_page_param),
            current_token,
            initial_page_param,
        }
    }
}

/// A paginated query: `pages`/`page_params` grow together as [`InfiniteQueryHandle::fetch_next_page`]
/// is called, stopping once `get_next_page_param` reports there's nothing left to fetch.
pub struct InfiniteQueryHandle<T: 'static, P: 'static, E: 'static> {
    pub pages: Signal<Vec<T>>,
    pub page_params: Signal<Vec<P>>,
    pub loading: Signal<bool>,
    pub error: Signal<Option<E>>,
    fetch_page: Rc<dyn Fn(P, CancelToken) -> Pin<Box<dyn Future<Output = Result<T, E>>>>>,
    get_next_page_param: Rc<dyn Fn(&[T], &[P]) -> Option<P>>,
    current_token: Rc<RefCell<Option<CancelToken>>>,
    initial_page_param: P,
}

impl<T: Clone + 'static, P: Clone + 'static, E: Clone + 'static> InfiniteQueryHandle<T, P, E> {
    /// `true` if [`Self::fetch_next_page`] has another page to fetch right now.
    pub fn has_next_page(&self) -> bool {
        self.next_param().is_some()
    }

    fn next_param(&self) -> Option<P> {
        let pages = self.pages.get_clone_untracked();
        let page_params = self.page_params.get_clone_untracked();
        if page_params.is_empty() {
            Some(self.initial_page_param.clone())
        } else {
            (self.get_next_page_param)(&pages, &page_params)
        }
    }

    /// Fetches and appends the next page, if there is one. Aborts whatever next-page fetch was
    /// already in flight (abort-on-refetch, mirroring [`crate::Resource::refresh`]'s `force`
    /// semantics rather than dedup) before starting. A no-op future if there is no next page.
    pub fn fetch_next_page(&self) -> Pin<Box<dyn Future<Output = ()>>> {
        let Some(param) = self.next_param() else {
            return Box::pin(async {});
        };
        if let Some(previous) = self.current_token.borrow().as_ref() {
            previous.cancel();
        }
        let token = CancelToken::new();
        *self.current_token.borrow_mut() = Some(token.clone());
        self.loading.set_silent(true);
        self.loading.notify();
        let fut = (self.fetch_page)(param.clone(), token.clone());
        let pages = self.pages;
        let page_params = self.page_params;
        let error = self.error;
        let loading = self.loading;
        Box::pin(async move {
            let result = fut.await;
            if token.is_cancelled() {
                return;
            }
            match result {
                Ok(value) => {
                    crate::root::batch(|| {
                        pages.update_silent(|p| p.push(value));
                        pages.notify();
                        page_params.update_silent(|p| p.push(param));
                        page_params.notify();
                    });
                }
                Err(err) => {
                    error.set_silent(Some(err));
                    error.notify();
                }
            }
            loading.set_silent(false);
            loading.notify();
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use serial_test::serial;

    use crate::*;

    fn run_futures_to_completion() {
        for _ in 0..64 {
            crate::run_frame_tasks();
            crate::drain_microtasks_for_test();
        }
    }

    #[test]
    fn query_recreates_resource_when_key_changes() {
        let _ = create_root(|| {
            let client = QueryClient::new();
            let scope = create_scope(None);
            let key = create_signal(1);
            let calls = Rc::new(RefCell::new(Vec::new()));
            let handle = scope
                .with_scope(|| {
                    let calls = calls.clone();
                    client.query(
                        move || key.get(),
                        move |k, _token| {
                            calls.borrow_mut().push(k);
                            async move { Ok::<_, String>(k * 10) }
                        },
                        QueryOptions::default(),
                    )
                })
                .unwrap();
            run_futures_to_completion();
            assert_eq!(handle.data(), Some(10));
            key.set(2);
            run_futures_to_completion();
            assert_eq!(handle.data(), Some(20));
            assert_eq!(*calls.borrow(), vec![1, 2]);
        });
    }

    #[test]
    fn get_and_set_query_data_round_trip() {
        let _ = create_root(|| {
            let client = QueryClient::new();
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    client.query(
                        move || "k",
                        move |_k, _token| async move { Ok::<_, String>(1) },
                        QueryOptions::default(),
                    )
                })
                .unwrap();
            run_futures_to_completion();
            assert_eq!(client.get_query_data::<i32, String>("k"), Some(1));
            client.set_query_data::<i32, String>("k", 99);
            assert_eq!(client.get_query_data::<i32, String>("k"), Some(99));
        });
    }

    #[test]
    fn find_queries_filters_by_predicate() {
        let _ = create_root(|| {
            let client = QueryClient::new();
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    client.query(
                        move || "users:1",
                        move |_k, _token| async move { Ok::<_, String>(1) },
                        QueryOptions::default(),
                    );
                    client.query(
                        move || "posts:1",
                        move |_k, _token| async move { Ok::<_, String>(1) },
                        QueryOptions::default(),
                    );
                })
                .unwrap();
            let users = client.find_queries(|k| k.contains("users"));
            assert_eq!(users.len(), 1);
        });
    }

    #[test]
    fn select_shares_computed_across_same_key_and_selector_id() {
        let _ = create_root(|| {
            let client = QueryClient::new();
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    client.query(
                        move || "k",
                        move |_k, _token| async move { Ok::<_, String>(42) },
                        QueryOptions::default(),
                    )
                })
                .unwrap();
            run_futures_to_completion();
            let a = client.select::<i32, Option<i32>, String>("k", "identity", |r| r.data.get_clone()).unwrap();
            let b = client.select::<i32, Option<i32>, String>("k", "identity", |r| r.data.get_clone()).unwrap();
            assert_eq!(a.get_clone(), Some(42));
            assert_eq!(b.get_clone(), Some(42));
        });
    }

    #[test]
    #[serial]
    fn refresh_interval_polls_on_a_timer() {
        let _ = create_root(|| {
            let pending: Rc<RefCell<Vec<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(Vec::new()));
            let pending_for_timer = pending.clone();
            set_stale_timer(move |_delay_ms, callback| {
                pending_for_timer.borrow_mut().push(callback);
            });

            let client = QueryClient::new();
            let scope = create_scope(None);
            let calls = Rc::new(RefCell::new(0));
            let handle = scope
                .with_scope(|| {
                    let calls = calls.clone();
                    client.query(
                        move || "k",
                        move |_k, _token| {
                            let calls = calls.clone();
                            async move {
                                *calls.borrow_mut() += 1;
                                Ok::<_, String>(*calls.borrow())
                            }
                        },
                        QueryOptions {
                            refresh_interval_ms: Some(1000),
                            ..Default::default()
                        },
                    )
                })
                .unwrap();
            run_futures_to_completion();
            assert_eq!(handle.data(), Some(1));
            // The first tick was scheduled right after the query's scope was set up.
            assert_eq!(pending.borrow().len(), 1);

            let first_tick = pending.borrow_mut().remove(0);
            first_tick();
            run_futures_to_completion();
            assert_eq!(handle.data(), Some(2));
            // Firing the tick reschedules itself for the next interval.
            assert_eq!(pending.borrow().len(), 1);

            scope.dispose();
            let second_tick = pending.borrow_mut().remove(0);
            second_tick();
            run_futures_to_completion();
            // The scope (and its `active` flag) were torn down by `scope.dispose()` above, so a
            // tick that fires afterward is a no-op rather than reaching into a disposed query.
            assert_eq!(*calls.borrow(), 2);
        });
    }

    #[test]
    fn infinite_query_appends_pages_atomically() {
        let _ = create_root(|| {
            let client = QueryClient::new();
            let handle = client.infinite_query::<i32, u32, String, _>(
                move || {},
                move |page: u32, _token| async move { Ok::<_, String>((page * 10) as i32) },
                move |_pages: &[i32], page_params: &[u32]| {
                    let last = *page_params.last().unwrap();
                    if last < 2 {
                        Some(last + 1)
                    } else {
                        None
                    }
                },
                0u32,
            );
            futures::executor::block_on(handle.fetch_next_page());
            assert_eq!(handle.pages.get_clone_untracked(), vec![0]);
            assert_eq!(handle.page_params.get_clone_untracked(), vec![0]);
            assert!(handle.has_next_page());
            futures::executor::block_on(handle.fetch_next_page());
            assert_eq!(handle.pages.get_clone_untracked(), vec![0, 10]);
            assert_eq!(handle.page_params.get_clone_untracked(), vec![0, 1]);
            futures::executor::block_on(handle.fetch_next_page());
            assert!(!handle.has_next_page());
        });
    }

    #[test]
    fn infinite_query_aborts_stale_fetch_on_key_change() {
        use std::future::Future;

        let _ = create_root(|| {
            let client = QueryClient::new();
            let gen = create_signal(0u32);
            let tx_slot: Rc<RefCell<Option<futures::channel::oneshot::Sender<()>>>> =
                Rc::new(RefCell::new(None));
            let tx_slot_for_fetch = tx_slot.clone();
            let handle = client.infinite_query::<i32, u32, String, _>(
                move || {
                    gen.track();
                },
                move |page: u32, _token| {
                    let tx_slot = tx_slot_for_fetch.clone();
                    async move {
                        let (tx, rx) = futures::channel::oneshot::channel();
                        *tx_slot.borrow_mut() = Some(tx);
                        let _ = rx.await;
                        Ok::<_, String>((page * 10) as i32)
                    }
                },
                move |_pages: &[i32], page_params: &[u32]| {
                    let last = *page_params.last().unwrap();
                    if last < 2 {
                        Some(last + 1)
                    } else {
                        None
                    }
                },
                0u32,
            );

            let mut fut = handle.fetch_next_page();
            let waker = futures::task::noop_waker();
            let mut cx = std::task::Context::from_waker(&waker);
            // parks on the oneshot receiver inside `fetch_page`, never reaching the `token.is_cancelled()`
            // check yet.
            assert!(fut.as_mut().poll(&mut cx).is_pending());

            // the key changes while that fetch is still in flight: the driver effect must cancel
            // its token so the stale resolution below is dropped instead of appending a page.
            gen.set(1);
            run_futures_to_completion();

            if let Some(tx) = tx_slot.borrow_mut().take() {
                let _ = tx.send(());
            }
            let _ = fut.as_mut().poll(&mut cx);

            assert_eq!(handle.pages.get_clone_untracked(), Vec::<i32>::new());
            assert_eq!(handle.page_params.get_clone_untracked(), Vec::<u32>::new());
        });
    }
}
