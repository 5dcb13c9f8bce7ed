//! [`ResourceCache`]: a keyed TTL/LRU cache of [`crate::Resource`]s with tag invalidation and
//! scope-bound ref counting.
//!
//! Grounded on the entry/observer
//! lifecycle sketched by `other_examples/…ifiokjr-leptoskit…query_client.rs.rs` (a keyed map of
//! query state with stale/ref-count/gc-timeout bookkeeping) and `…patr-cloud-leptos-query…
//! query_executor.rs.rs`'s `ensure_not_stale`/`ensure_not_invalid`/`ensure_not_disposed`
//! checks — translated here into `touch`/`evict_if_needed`/`invalidate_*` on top of this crate's
//! own [`crate::Resource`] instead of a bespoke query-state enum. Uses `rustc-hash::FxHashMap` the
//! way that pack file uses a plain `HashMap`, since this cache is purely in-process and never
//! hashed against attacker input.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::key::{EncodedKey, Key};
use crate::resource::{create_resource, CancelToken, Resource, ResourceOptions};
use crate::scope::{create_scope, Scope};

/// Tunable limits for [`ResourceCache::configure`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub warn_on_eviction: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            warn_on_eviction: true,
        }
    }
}

/// Options recognized by [`ResourceCache::create`].
pub struct CacheEntryOptions<T, E> {
    pub ttl_ms: Option<u64>,
    pub tags: Vec<String>,
    /// Keeps the entry alive at `ref_count == 0` instead of being released/evicted.
    pub persist: bool,
    /// Suppress the "created outside any scope" warning for callers that intentionally want a
    /// process-wide, unscoped cache entry (implies `persist`).
    pub warn_if_no_scope: bool,
    pub resource: ResourceOptions<T, E>,
}

impl<T, E> Default for CacheEntryOptions<T, E> {
    fn default() -> Self {
        Self {
            ttl_ms: None,
            tags: Vec::new(),
            persist: false,
            warn_if_no_scope: true,
            resource: ResourceOptions::default(),
        }
    }
}

struct Entry {
    /// Bumped every time a key gets a fresh entry (miss, or expired-and-recreated). Lets a scope's
    /// deferred release (run from `on_cleanup`, long after `create` returned) detect that the
    /// entry it originally acquired a reference to has since been replaced under the same key, and
    /// avoid releasing a ref count that belongs to a different entry entirely.
    generation: u64,
    created_at: std::cell::Cell<Instant>,
    ttl_ms: std::cell::Cell<Option<u64>>,
    tags: RefCell<FxHashSet<String>>,
    stale: std::cell::Cell<bool>,
    ref_count: std::cell::Cell<u32>,
    persist: std::cell::Cell<bool>,
    cache_scope: Scope,
    /// The boxed [`Resource<T, E>`] this entry wraps. Downcast with the same `T, E` used at
    /// `create` time; a mismatched downcast at another operation is this cache's one type-erasure
    /// hazard, documented on each accessor.
    resource: Box<dyn Any>,
    /// Fires a force/non-force refresh without the caller needing to know `T`/`E`. Used by
    /// `invalidate`/`invalidate_tag(s)`, which only deal in keys.
    refresh: Box<dyn Fn(bool)>,
    /// Cancels the in-flight run without the caller needing to know `T`/`E`. Used by
    /// `query_client.rs`'s `cancel_queries`, which (like `invalidate`) only deals in keys.
    cancel: Box<dyn Fn()>,
}

/// A keyed cache of [`Resource`]s: TTL + LRU eviction, tag-based bulk invalidation, and ref
/// counting tied to the calling [`Scope`] so a resource outlives exactly as long as something is
/// still around to read it.
pub struct ResourceCache {
    entries: RefCell<FxHashMap<EncodedKey, Entry>>,
    tag_index: RefCell<FxHashMap<String, FxHashSet<EncodedKey>>>,
    /// `PerScopeKeyMap`: one ref per (scope, key) pair, so a scope calling `create` twice with the
    /// same key acquires only once, and releases exactly once on its own cleanup. The value is the
    /// generation acquired against, so a release can detect a since-replaced entry (see
    /// [`Entry::generation`]).
    per_scope: RefCell<FxHashMap<Scope, FxHashMap<EncodedKey, u64>>>,
    next_generation: std::cell::Cell<u64>,
    config: std::cell::Cell<CacheConfig>,
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("entries", &self.entries.borrow().len())
            .finish()
    }
}

impl ResourceCache {
    /// Creates a fresh, empty cache. Per spec.md's "global mutable state" note the intended
    /// topology is a single process-wide instance — wrap the result in an `Rc` and hand it out via
    /// whatever context mechanism the host uses (this crate does not impose one; see
    /// `query_client.rs`, which is constructed with one of these).
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            entries: RefCell::new(FxHashMap::default()),
            tag_index: RefCell::new(FxHashMap::default()),
            per_scope: RefCell::new(FxHashMap::default()),
            next_generation: std::cell::Cell::new(0),
            config: std::cell::Cell::new(CacheConfig::default()),
        })
    }

    pub fn configure(&self, config: CacheConfig) {
        self.config.set(config);
    }

    /// Gets-or-creates the cached [`Resource<T, E>`] for `key`, acquiring one reference for the
    /// calling scope (the scope current when `create` is called — not `options.resource`'s
    /// scope). Calling `create` again with the same key from the same scope is idempotent: it
    /// re-touches the existing entry instead of acquiring a second reference.
    ///
    /// If there is no current scope and `options.persist` is not set, the resource is created but
    /// never cached (a fresh, unref-counted [`Resource`] is returned every call) — see the module
    /// docs' "safe-by-default" note. A `tracing::warn!` fires unless `warn_if_no_scope` is false.
    pub fn create<T, E, Fut>(
        self: &Rc<Self>,
        key: impl Into<Key>,
        fetch_fn: impl Fn(CancelToken) -> Fut + 'static,
        options: CacheEntryOptions<T, E>,
    ) -> Resource<T, E>
    where
        T: Clone + 'static,
        E: Clone + 'static,
        Fut: std::future::Future<Output = Result<T, E>> + 'static,
    {
        let encoded = key.into().encode();
        let calling_scope = crate::scope::calling_scope();

        if calling_scope.is_none() && !options.persist {
            #[cfg(feature = "trace")]
            if options.warn_if_no_scope {
                tracing::warn!(key = %encoded, "ResourceCache::create called outside any scope without persist=true; returning an uncached resource");
            }
            let _ = options.warn_if_no_scope;
            return create_resource(fetch_fn, options.resource);
        }

        if let Some(entry) = self.entries.borrow().get(&encoded) {
            if self.is_expired(entry) {
                if entry.ref_count.get() == 0 {
                    // fall through to miss path below, after dropping the borrow
                } else {
                    entry.stale.set(true);
                    let resource = Self::downcast::<T, E>(entry, &encoded);
                    let _ = resource.refresh(true);
                    entry.created_at.set(Instant::now());
                    self.acquire(calling_scope, &encoded);
                    return resource;
                }
            } else {
                self.set_entry_tags(&encoded, entry, &options.tags);
                entry.persist.set(entry.persist.get() || options.persist);
                entry.created_at.set(Instant::now());
                let resource = Self::downcast::<T, E>(entry, &encoded);
                self.acquire(calling_scope, &encoded);
                return resource;
            }
        }

        // Expired with no remaining references: remove (disposing its cache_scope) and recreate.
        self.remove_entry(&encoded);
        let cache_scope = create_scope(None);
        let resource = cache_scope
            .with_scope(|| create_resource(fetch_fn, options.resource))
            .expect("freshly created cache_scope cannot already be disposed");
        let refresh_resource = resource.clone();
        let cancel_resource = resource.clone();
        let generation = self.next_generation.get();
        self.next_generation.set(generation + 1);
        let entry = Entry {
            generation,
            created_at: std::cell::Cell::new(Instant::now()),
            ttl_ms: std::cell::Cell::new(options.ttl_ms),
            tags: RefCell::new(FxHashSet::default()),
            stale: std::cell::Cell::new(false),
            ref_count: std::cell::Cell::new(0),
            persist: std::cell::Cell::new(options.persist),
            cache_scope,
            resource: Box::new(resource.clone()),
            refresh: Box::new(move |force| {
                let _ = refresh_resource.refresh(force);
            }),
            cancel: Box::new(move || cancel_resource.cancel()),
        };
        self.entries.borrow_mut().insert(encoded.clone(), entry);
        {
            let entries = self.entries.borrow();
            let entry = entries.get(&encoded).unwrap();
            self.set_entry_tags(&encoded, entry, &options.tags);
        }
        self.acquire(calling_scope, &encoded);
        self.evict_if_needed();
        resource
    }

    fn downcast<T: 'static, E: 'static>(entry: &Entry, key: &EncodedKey) -> Resource<T, E> {
        entry
            .resource
            .downcast_ref::<Resource<T, E>>()
            .unwrap_or_else(|| panic!("ResourceCache type mismatch for key {key}: accessed with different T/E than it was created with"))
            .clone()
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        match entry.ttl_ms.get() {
            Some(ttl) => entry.created_at.get().elapsed() >= Duration::from_millis(ttl),
            None => false,
        }
    }

    fn acquire(self: &Rc<Self>, scope: Option<Scope>, key: &EncodedKey) {
        let Some(scope) = scope else { return };
        let Some(generation) = self.entries.borrow().get(key).map(|e| e.generation) else {
            return;
        };
        let mut per_scope = self.per_scope.borrow_mut();
        let first_acquisition_for_scope = !per_scope.contains_key(&scope);
        let generations = per_scope.entry(scope).or_default();
        let already_held = generations.get(key) == Some(&generation);
        generations.insert(key.clone(), generation);
        if !already_held {
            if let Some(entry) = self.entries.borrow().get(key) {
                entry.ref_count.set(entry.ref_count.get() + 1);
            }
        }
        drop(per_scope);
        if first_acquisition_for_scope {
            let cache = self.clone();
            scope.on_cleanup(move || cache.release_scope(scope));
        }
    }

    /// Releases every reference a scope acquired into this cache. Registered once, on first
    /// acquisition, as the scope's own cleanup — spec.md's "on scope cleanup, the per-scope map is
    /// drained and each tracked entry released".
    fn release_scope(&self, scope: Scope) {
        let generations = self.per_scope.borrow_mut().remove(&scope).unwrap_or_default();
        for (key, generation) in generations {
            self.release(&key, generation);
        }
    }

    /// Releases one reference on `key`'s entry, but only if it is still at `generation` — if the
    /// entry has since been removed and recreated under the same key, this scope's reference
    /// belonged to a previous, now-gone entry and must not affect the new one.
    fn release(&self, key: &EncodedKey, generation: u64) {
        let should_remove = {
            let entries = self.entries.borrow();
            let Some(entry) = entries.get(key) else { return };
            if entry.generation != generation {
                return;
            }
            let remaining = entry.ref_count.get().saturating_sub(1);
            entry.ref_count.set(remaining);
            remaining == 0 && !entry.persist.get()
        };
        if should_remove {
            self.remove_entry(key);
        }
    }

    fn remove_entry(&self, key: &EncodedKey) {
        let Some(entry) = self.entries.borrow_mut().remove(key) else {
            return;
        };
        entry.cache_scope.dispose();
        let mut tag_index = self.tag_index.borrow_mut();
        tag_index.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    fn set_entry_tags(&self, key: &EncodedKey, entry: &Entry, tags: &[String]) {
        if tags.is_empty() {
            return;
        }
        let mut entry_tags = entry.tags.borrow_mut();
        let mut tag_index = self.tag_index.borrow_mut();
        for tag in tags {
            if entry_tags.insert(tag.clone()) {
                tag_index.entry(tag.clone()).or_default().insert(key.clone());
            }
        }
    }

    /// Removes `key`'s entry (or every entry, if `key` is `None`), disposing each `cache_scope`.
    pub fn clear(&self, key: Option<impl Into<Key>>) {
        match key {
            Some(key) => self.remove_entry(&key.into().encode()),
            None => {
                let keys: Vec<_> = self.entries.borrow().keys().cloned().collect();
                for key in keys {
                    self.remove_entry(&key);
                }
            }
        }
    }

    /// Marks `key`'s entry stale and, if `revalidate`, calls `refresh(force)` on it. A no-op if
    /// `key` isn't cached.
    pub fn invalidate(&self, key: impl Into<Key>, revalidate: bool, force: bool) {
        let encoded = key.into().encode();
        let entries = self.entries.borrow();
        let Some(entry) = entries.get(&encoded) else {
            return;
        };
        entry.stale.set(true);
        if revalidate {
            (entry.refresh)(force);
        }
    }

    /// Invalidates every entry tagged `tag`. See [`Self::invalidate`].
    pub fn invalidate_tag(&self, tag: &str, revalidate: bool, force: bool) {
        self.invalidate_tags(std::slice::from_ref(&tag.to_string()), revalidate, force);
    }

    /// Invalidates every entry tagged with any of `tags`.
    pub fn invalidate_tags(&self, tags: &[String], revalidate: bool, force: bool) {
        let keys: FxHashSet<EncodedKey> = {
            let tag_index = self.tag_index.borrow();
            tags.iter()
                .filter_map(|t| tag_index.get(t))
                .flatten()
                .cloned()
                .collect()
        };
        for key in keys {
            let entries = self.entries.borrow();
            let Some(entry) = entries.get(&key) else {
                continue;
            };
            entry.stale.set(true);
            if revalidate {
                (entry.refresh)(force);
            }
        }
    }

    /// Reads `key`'s current data without acquiring a reference or creating an entry. Returns
    /// `None` both when the key isn't cached and when it is cached but has no data yet.
    pub fn get_data<T: Clone + 'static, E: 'static>(&self, key: impl Into<Key>) -> Option<T> {
        let encoded = key.into().encode();
        let entries = self.entries.borrow();
        let entry = entries.get(&encoded)?;
        let resource = entry.resource.downcast_ref::<Resource<T, E>>()?;
        resource.data.get_clone_untracked()
    }

    /// Writes `key`'s data directly via [`Resource::set_data`]. A no-op if `key` isn't cached.
    pub fn set_data<T: Clone + 'static, E: 'static>(&self, key: impl Into<Key>, value: T) {
        let encoded = key.into().encode();
        let entries = self.entries.borrow();
        let Some(entry) = entries.get(&encoded) else {
            return;
        };
        if let Some(resource) = entry.resource.downcast_ref::<Resource<T, E>>() {
            resource.set_data(value);
        }
    }

    /// Cancels `key`'s in-flight run, if any and if cached.
    pub fn cancel<T: 'static, E: 'static>(&self, key: impl Into<Key>) {
        let encoded = key.into().encode();
        let entries = self.entries.borrow();
        let Some(entry) = entries.get(&encoded) else {
            return;
        };
        if let Some(resource) = entry.resource.downcast_ref::<Resource<T, E>>() {
            resource.cancel();
        }
    }

    /// Like [`Self::cancel`] but without needing to know `key`'s `T`/`E` — used by
    /// `query_client.rs`'s bulk `cancel_queries`, which only deals in keys. A no-op if `key` isn't
    /// cached.
    pub fn cancel_erased(&self, key: impl Into<Key>) {
        let encoded = key.into().encode();
        let entries = self.entries.borrow();
        if let Some(entry) = entries.get(&encoded) {
            (entry.cancel)();
        }
    }

    /// Returns a clone of `key`'s cached [`Resource<T, E>`], if cached and if `T`/`E` match what it
    /// was created with. Used by `query_client.rs`'s `select`, which needs the live resource handle
    /// (not just a data snapshot) to build a tracked derivation over it.
    pub(crate) fn resource_of<T: Clone + 'static, E: Clone + 'static>(
        &self,
        key: &EncodedKey,
    ) -> Option<Resource<T, E>> {
        self.entries
            .borrow()
            .get(key)
            .and_then(|e| e.resource.downcast_ref::<Resource<T, E>>())
            .cloned()
    }

    /// Every currently-cached key, in arbitrary order.
    pub fn keys(&self) -> Vec<EncodedKey> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Every currently-cached key tagged `tag`.
    pub fn keys_by_tag(&self, tag: &str) -> Vec<EncodedKey> {
        self.tag_index
            .borrow()
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Evicts unreferenced entries, oldest-`created_at`-first, until `entries.len() <=
    /// max_entries`. Referenced (`ref_count > 0`) entries are never evicted here. Warns (once per
    /// call, if `warn_on_eviction`) if the limit is still exceeded afterwards because every
    /// remaining entry is referenced.
    pub fn evict_if_needed(&self) {
        let max_entries = self.config.get().max_entries;
        let len = self.entries.borrow().len();
        if len <= max_entries {
            return;
        }
        let mut candidates: Vec<(EncodedKey, Instant)> = self
            .entries
            .borrow()
            .iter()
            .filter(|(_, e)| e.ref_count.get() == 0)
            .map(|(k, e)| (k.clone(), e.created_at.get()))
            .collect();
        candidates.sort_by_key(|(_, created_at)| *created_at);
        let to_remove = len - max_entries;
        for (key, _) in candidates.into_iter().take(to_remove) {
            self.remove_entry(&key);
        }
        if self.entries.borrow().len() > max_entries {
            #[cfg(feature = "trace")]
            if self.config.get().warn_on_eviction {
                tracing::warn!(
                    max_entries,
                    current = self.entries.borrow().len(),
                    "ResourceCache still exceeds max_entries after eviction; every remaining entry is referenced"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::*;

    fn cache() -> Rc<ResourceCache> {
        ResourceCache::new()
    }

    #[test]
    fn create_is_idempotent_within_the_same_scope() {
        let _ = create_root(|| {
            let c = cache();
            let calls = Rc::new(RefCell::new(0));
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    for _ in 0..3 {
                        let calls = calls.clone();
                        c.create(
                            "k",
                            move |_token| {
                                *calls.borrow_mut() += 1;
                                async move { Ok::<_, String>(1) }
                            },
                            CacheEntryOptions::default(),
                        );
                    }
                })
                .unwrap();
            assert_eq!(c.keys().len(), 1);
        });
    }

    #[test]
    fn release_on_scope_dispose_removes_unpersisted_entry() {
        let _ = create_root(|| {
            let c = cache();
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    c.create(
                        "k",
                        move |_token| async move { Ok::<_, String>(1) },
                        CacheEntryOptions::default(),
                    );
                })
                .unwrap();
            assert_eq!(c.keys().len(), 1);
            scope.dispose();
            assert_eq!(c.keys().len(), 0);
        });
    }

    #[test]
    fn persisted_entry_survives_zero_ref_count() {
        let _ = create_root(|| {
            let c = cache();
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    c.create(
                        "k",
                        move |_token| async move { Ok::<_, String>(1) },
                        CacheEntryOptions {
                            persist: true,
                            ..Default::default()
                        },
                    );
                })
                .unwrap();
            scope.dispose();
            assert_eq!(c.keys().len(), 1);
        });
    }

    #[test]
    fn tag_invalidation_only_touches_tagged_entries() {
        let _ = create_root(|| {
            let c = cache();
            let scope = create_scope(None);
            scope
                .with_scope(|| {
                    c.create(
                        "u1",
                        move |_token| async move { Ok::<_, String>(1) },
                        CacheEntryOptions {
                            persist: true,
                            tags: vec!["users".to_string()],
                            ..Default::default()
                        },
                    );
                    c.create(
                        "p1",
                        move |_token| async move { Ok::<_, String>(1) },
                        CacheEntryOptions {
                            persist: true,
                            tags: vec!["posts".to_string()],
                            ..Default::default()
                        },
                    );
                })
                .unwrap();
            assert_eq!(c.keys_by_tag("users"), vec![Key::from("u1").encode()]);
            c.invalidate_tag("users", false, false);
            // Only a behavioral smoke check here — full refresh semantics are exercised in
            // resource.rs; this just confirms the tag index routes to the right key set.
            assert_eq!(c.keys_by_tag("posts").len(), 1);
        });
    }

    #[test]
    fn uncached_outside_scope_returns_functional_but_unshared_resource() {
        let _ = create_root(|| {
            let c = cache();
            let a = c.create(
                "k",
                move |_token| async move { Ok::<_, String>(1) },
                CacheEntryOptions::default(),
            );
            let b = c.create(
                "k",
                move |_token| async move { Ok::<_, String>(2) },
                CacheEntryOptions::default(),
            );
            assert_eq!(c.keys().len(), 0);
            a.set_data(10);
            b.set_data(20);
            assert_eq!(a.data.get_clone(), Some(10));
            assert_eq!(b.data.get_clone(), Some(20));
        });
    }

    #[test]
    fn evict_if_needed_removes_oldest_unreferenced_entries_first() {
        let _ = create_root(|| {
            let c = cache();
            c.configure(CacheConfig {
                max_entries: 1,
                warn_on_eviction: false,
            });
            c.create(
                "a",
                move |_token| async move { Ok::<_, String>(1) },
                CacheEntryOptions {
                    persist: true,
                    ..Default::default()
                },
            );
            c.create(
                "b",
                move |_token| async move { Ok::<_, String>(1) },
                CacheEntryOptions {
                    persist: true,
                    ..Default::default()
                },
            );
            assert_eq!(c.keys().len(), 1);
            assert_eq!(c.keys(), vec![Key::from("b").encode()]);
        });
    }
}
