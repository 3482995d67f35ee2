use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

/// A spawned computation whose output can be awaited by any number of callers.
pub(crate) type SharedTask<T> = Shared<BoxFuture<'static, T>>;

/// Spawns `future` on the current Tokio runtime and returns a shareable handle to its output.
///
/// The spawned task drives the future to completion even if every handle is
/// dropped, so side effects recorded inside it always happen.
///
/// # Panics
///
/// Panics when called outside of a Tokio runtime.
pub(crate) fn spawn_shared<T>(future: impl Future<Output = T> + Send + 'static) -> SharedTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    let shared = shared_task(future);
    tokio::spawn(shared.clone());
    shared
}

/// Wraps `future` in a shareable handle without starting it.
///
/// Callers that need to publish the handle before the future first runs spawn
/// a clone themselves.
pub(crate) fn shared_task<T>(future: impl Future<Output = T> + Send + 'static) -> SharedTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    future.boxed().shared()
}
