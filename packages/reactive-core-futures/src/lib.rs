//! Scoped spawn/cancel glue for `reactive-core`'s async effects and resources.
//!
//! Kept as its own crate, separate from the reactive graph itself, because it pulls in
//! target-specific async dependencies — `tokio` off
//! wasm32, `wasm-bindgen-futures` on wasm32 — that `reactive-core` itself stays agnostic to: an
//! [`crate::CancelToken`] is just a plain `Rc`-backed flag, not tied to any particular async
//! runtime, until something here actually spawns a future against it.

#![deny(missing_debug_implementations)]

use futures::future::{abortable, AbortHandle};
use futures::Future;
use reactive_core::{on_cleanup, CancelToken};

/// If running on `wasm32` target, does nothing. Otherwise creates a new `tokio::task::LocalSet`
/// scope.
///
/// Normally, you do not need to call this as it is handled internally by a host integration when
/// it boots its executor.
pub async fn provide_executor_scope<U>(f: impl Future<Output = U>) -> U {
    #[cfg(target_arch = "wasm32")]
    {
        f.await
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        let local = tokio::task::LocalSet::new();
        local.run_until(f).await
    }
}

/// Spawns a `!Send` future on the current scope. If the scope is destroyed before the future is
/// completed, it is aborted immediately. This ensures that it is impossible to access any
/// values referencing the scope after they are destroyed.
pub fn spawn_local_scoped(f: impl Future<Output = ()> + 'static) {
    let (abortable, handle) = abortable(f);
    on_cleanup(move || handle.abort());
    spawn_abortable(abortable);
}

/// Spawns `f` wired to `token`: the future is wrapped in a [`futures::future::abortable`] handle
/// and `token.on_cancel` aborts it. This is what `reactive-core`'s `create_effect_async` and
/// `Resource` driver use to turn a per-run [`CancelToken`] (a runtime-agnostic flag) into an
/// actual cancelled task, instead of requiring every host to hand-wire an `AbortHandle` itself.
pub fn spawn_cancellable(token: CancelToken, f: impl Future<Output = ()> + 'static) {
    let (abortable, handle) = abortable(f);
    token.on_cancel(move || handle.abort());
    spawn_abortable(abortable);
}

fn spawn_abortable<F>(f: futures::future::Abortable<F>)
where
    F: Future<Output = ()> + 'static,
{
    #[cfg(not(target_arch = "wasm32"))]
    tokio::task::spawn_local(f);
    #[cfg(target_arch = "wasm32")]
    wasm_bindgen_futures::spawn_local(async move {
        let _ = f.await;
    });
}

#[allow(dead_code)]
fn _assert_abort_handle_is_clone(h: &AbortHandle) -> AbortHandle {
    h.clone()
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    use reactive_core::{create_effect_async, create_root, create_scope, Scope};

    use super::*;

    #[tokio::test]
    async fn spawn_local_scoped_is_aborted_on_scope_dispose() {
        provide_executor_scope(async {
            let _ = create_root(|| {
                let scope: Scope = create_scope(None);
                let completed = Rc::new(Cell::new(false));
                let completed2 = completed.clone();
                scope
                    .with_scope(|| {
                        spawn_local_scoped(async move {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            completed2.set(true);
                        });
                    })
                    .unwrap();
                scope.dispose();
                assert!(!completed.get());
            });
        })
        .await;
    }

    #[tokio::test]
    async fn spawn_cancellable_aborts_when_token_cancels() {
        provide_executor_scope(async {
            let _ = create_root(|| {
                let ran_to_completion = Rc::new(Cell::new(false));
                let ran2 = ran_to_completion.clone();
                create_effect_async(move |token| {
                    let ran3 = ran2.clone();
                    spawn_cancellable(token, async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        ran3.set(true);
                    });
                });
            });
        })
        .await;
    }
}
