//! Query bindings: a call site's view of a cached query.
//!
//! A [`QueryBinding`] derives a cache key, binds to the matching entry of a
//! [`QueryClient`], and keeps following the right entry as the key changes.
//!
//! # Lifecycle
//!
//! 1. On mount the entry is refetched unconditionally, so the binding starts
//!    from fresh data even if the cache was populated earlier.
//! 2. Whenever a reactive key changes, the binding switches to the entry of
//!    the new key and refreshes it (fetching only if that entry is stale).
//! 3. On [`SystemSignal::Focus`] / [`SystemSignal::Online`] the current entry
//!    is refetched, unless disabled in the options.
//! 4. Dropping or disposing the binding stops all of the above.
//!
//! Fetches triggered by the binding itself never report errors to anyone;
//! they are logged and recorded in the entry's `error`. Only calls to
//! [`QueryBinding::refetch`] and [`QueryBinding::refresh`] return them.
//!
//! # Example
//!
//! ```rust
//! use revalidate::cache::QueryClient;
//! use revalidate::error::QueryError;
//! use revalidate::query::{QueryBinding, QueryOptions};
//! use tokio::sync::watch;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> revalidate::Result<()> {
//! let client = QueryClient::new();
//! let (user_id, key) = watch::channel("user-1".to_string());
//!
//! let user = QueryBinding::prefetch(
//!     &client,
//!     QueryOptions::new(key, || async { Ok::<_, QueryError>("Ada".to_string()) }),
//! )
//! .await?;
//! assert_eq!(user.data(), Some("Ada".to_string()));
//!
//! // Switching the key rebinds to (and fetches) the entry for "user-2".
//! user_id.send_replace("user-2".to_string());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::cache::{EntryOptions, QueryClient, QueryEntry};
use crate::error::{QueryError, Result};
use crate::signal::SystemSignal;
use crate::state::QueryState;

/// Where a binding takes its cache key from.
#[derive(Debug, Clone)]
pub enum QueryKey {
    /// A fixed key.
    Static(String),
    /// A key that may change over time; the binding follows every change.
    Reactive(watch::Receiver<String>),
}

impl QueryKey {
    /// Returns the key as of now.
    pub fn current(&self) -> String {
        match self {
            Self::Static(key) => key.clone(),
            Self::Reactive(rx) => rx.borrow().clone(),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(key: &str) -> Self {
        Self::Static(key.to_string())
    }
}

impl From<String> for QueryKey {
    fn from(key: String) -> Self {
        Self::Static(key)
    }
}

impl From<watch::Receiver<String>> for QueryKey {
    fn from(rx: watch::Receiver<String>) -> Self {
        Self::Reactive(rx)
    }
}

/// Options of a [`QueryBinding`].
///
/// Unset fields fall back to the client's [`QueryConfig`](crate::config::QueryConfig).
pub struct QueryOptions<T, E = QueryError> {
    key: QueryKey,
    entry: EntryOptions<T, E>,
    refetch_on_focus: Option<bool>,
    refetch_on_reconnect: Option<bool>,
}

impl<T, E> QueryOptions<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates options for `key` fetched by `query`.
    pub fn new<F, Fut>(key: impl Into<QueryKey>, query: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        Self::from_entry_options(key, EntryOptions::new(query))
    }
}

impl<T, E> QueryOptions<T, E> {
    /// Creates options for `key` from prepared entry options.
    pub fn from_entry_options(key: impl Into<QueryKey>, entry: EntryOptions<T, E>) -> Self {
        Self {
            key: key.into(),
            entry,
            refetch_on_focus: None,
            refetch_on_reconnect: None,
        }
    }

    /// Overrides the client-wide cache time for this key.
    #[must_use]
    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.entry = self.entry.with_cache_time(cache_time);
        self
    }

    /// Computes the data exposed before the first fetch settles.
    #[must_use]
    pub fn with_initial_value(mut self, initial: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.entry = self.entry.with_initial_value(initial);
        self
    }

    /// Overrides whether this query refetches on [`SystemSignal::Focus`].
    #[must_use]
    pub const fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = Some(enabled);
        self
    }

    /// Overrides whether this query refetches on [`SystemSignal::Online`].
    #[must_use]
    pub const fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = Some(enabled);
        self
    }
}

impl<T, E> fmt::Debug for QueryOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("entry", &self.entry)
            .field("refetch_on_focus", &self.refetch_on_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .finish()
    }
}

/// A mounted query: reactive state plus `refetch`/`refresh` for the current key.
pub struct QueryBinding<T, E = QueryError> {
    current: watch::Receiver<QueryEntry<T, E>>,
    token: CancellationToken,
}

impl<T, E> QueryBinding<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    /// Binds to the entry for the current key and refetches it in the background.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTypeMismatch`](crate::Error::KeyTypeMismatch) if the
    /// key is already registered with a different value or error type.
    pub fn mount(client: &QueryClient, options: QueryOptions<T, E>) -> Result<Self> {
        let binding = Self::bind(client, options)?;
        binding.entry().refetch_in_background("mount");
        Ok(binding)
    }

    /// Like [`mount`](Self::mount), but waits for the initial fetch to settle.
    ///
    /// Used when rendering ahead of time, so that the first output already
    /// holds fetched data instead of the placeholder state. A failed initial
    /// fetch is not an error here; it is recorded in the binding's `error`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTypeMismatch`](crate::Error::KeyTypeMismatch) if the
    /// key is already registered with a different value or error type.
    pub async fn prefetch(client: &QueryClient, options: QueryOptions<T, E>) -> Result<Self> {
        let binding = Self::bind(client, options)?;
        let entry = binding.entry();
        if let Err(error) = entry.refetch().await {
            tracing::debug!(key = entry.key(), %error, "prefetch failed");
        }
        Ok(binding)
    }

    fn bind(client: &QueryClient, options: QueryOptions<T, E>) -> Result<Self> {
        let QueryOptions {
            key,
            entry: entry_options,
            refetch_on_focus,
            refetch_on_reconnect,
        } = options;

        let (key_rx, initial_key) = match key {
            QueryKey::Static(key) => (None, key),
            QueryKey::Reactive(mut rx) => {
                let key = rx.borrow_and_update().clone();
                (Some(rx), key)
            }
        };

        let entry = client.ensure_entry(&initial_key, &entry_options)?;
        let (entry_tx, current) = watch::channel(entry);
        let token = CancellationToken::new();

        let watcher = Watcher {
            client: client.clone(),
            entry_options,
            key_rx,
            signals: client.signals().subscribe(),
            entry_tx,
            refetch_on_focus: refetch_on_focus.unwrap_or(client.config().refetch_on_focus),
            refetch_on_reconnect: refetch_on_reconnect
                .unwrap_or(client.config().refetch_on_reconnect),
        };
        tokio::spawn(watcher.run(token.clone()));

        Ok(Self { current, token })
    }

    /// Refetches the current entry, ignoring freshness.
    pub fn refetch(&self) -> BoxFuture<'static, std::result::Result<T, E>> {
        self.entry().refetch()
    }

    /// Refreshes the current entry, fetching only if it is stale.
    pub fn refresh(&self) -> BoxFuture<'static, std::result::Result<T, E>> {
        self.entry().refresh()
    }

    /// Returns the current entry's state, following it across key changes.
    ///
    /// The stream yields the current state right away and then every change.
    /// It ends once the binding is disposed.
    pub fn stream(&self) -> BoxStream<'static, QueryState<T, E>> {
        let mut entries = self.current.clone();
        let states = entries.borrow_and_update().subscribe();

        stream::unfold(Follow::Initial { entries, states }, |follow| async move {
            match follow {
                Follow::Initial { entries, mut states } => {
                    let state = states.borrow_and_update().clone();
                    Some((state, Follow::Watching { entries, states }))
                }
                Follow::Watching {
                    mut entries,
                    mut states,
                } => {
                    tokio::select! {
                        changed = entries.changed() => {
                            changed.ok()?;
                            states = entries.borrow_and_update().subscribe();
                        }
                        changed = states.changed() => {
                            changed.ok()?;
                        }
                    }
                    let state = states.borrow_and_update().clone();
                    Some((state, Follow::Watching { entries, states }))
                }
            }
        })
        .boxed()
    }

    /// Waits for the next state change and returns the new state.
    ///
    /// Switching to another entry counts as a change. Returns `None` once the
    /// binding is disposed.
    pub async fn changed(&self) -> Option<QueryState<T, E>> {
        let mut states = self.stream();
        states.next().await?;
        states.next().await
    }
}

impl<T, E> QueryBinding<T, E> {
    /// Returns the entry the binding is currently bound to.
    pub fn entry(&self) -> QueryEntry<T, E> {
        self.current.borrow().clone()
    }

    /// Returns the current cache key.
    pub fn key(&self) -> String {
        self.current.borrow().key().to_string()
    }

    /// Returns a receiver notified whenever the binding switches entries.
    pub fn watch_entry(&self) -> watch::Receiver<QueryEntry<T, E>> {
        self.current.clone()
    }

    /// Stops following key changes and lifecycle signals.
    ///
    /// The binding keeps exposing the entry it was bound to last.
    pub fn dispose(&self) {
        self.token.cancel();
    }

    /// Returns whether [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T, E> QueryBinding<T, E>
where
    T: Clone,
    E: Clone,
{
    /// Returns the current entry's last known data.
    pub fn data(&self) -> Option<T> {
        self.entry().data()
    }

    /// Returns the current entry's last error.
    pub fn error(&self) -> Option<E> {
        self.entry().error()
    }

    /// Returns whether the current entry is fetching.
    pub fn is_fetching(&self) -> bool {
        self.entry().is_fetching()
    }

    /// Returns a copy of the current entry's state.
    pub fn snapshot(&self) -> QueryState<T, E> {
        self.entry().snapshot()
    }
}

impl<T, E> Drop for QueryBinding<T, E> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<T, E> fmt::Debug for QueryBinding<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBinding")
            .field("entry", &*self.current.borrow())
            .field("disposed", &self.token.is_cancelled())
            .finish()
    }
}

/// Internal state machine for [`QueryBinding::stream`].
enum Follow<T, E> {
    Initial {
        entries: watch::Receiver<QueryEntry<T, E>>,
        states: watch::Receiver<QueryState<T, E>>,
    },
    Watching {
        entries: watch::Receiver<QueryEntry<T, E>>,
        states: watch::Receiver<QueryState<T, E>>,
    },
}

/// Background task reacting to key changes and lifecycle signals.
struct Watcher<T, E> {
    client: QueryClient,
    entry_options: EntryOptions<T, E>,
    key_rx: Option<watch::Receiver<String>>,
    signals: broadcast::Receiver<SystemSignal>,
    entry_tx: watch::Sender<QueryEntry<T, E>>,
    refetch_on_focus: bool,
    refetch_on_reconnect: bool,
}

impl<T, E> Watcher<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                key = next_key(&mut self.key_rx) => {
                    if let Some(key) = key {
                        self.rebind(&key);
                    }
                }
                signal = self.signals.recv() => match signal {
                    Ok(signal) => self.on_signal(signal),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::trace!(skipped, "lagged behind system signals");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::trace!(key = self.entry_tx.borrow().key(), "query binding disposed");
    }

    fn rebind(&self, key: &str) {
        match self.client.ensure_entry(key, &self.entry_options) {
            Ok(entry) => {
                if entry.ptr_eq(&self.entry_tx.borrow()) {
                    return;
                }
                tracing::debug!(key, "query key changed");
                self.entry_tx.send_replace(entry.clone());
                entry.refresh_in_background("key change");
            }
            Err(error) => tracing::warn!(key, %error, "cannot bind query to new key"),
        }
    }

    fn on_signal(&self, signal: SystemSignal) {
        let enabled = match signal {
            SystemSignal::Focus => self.refetch_on_focus,
            SystemSignal::Online => self.refetch_on_reconnect,
        };
        if enabled {
            let entry = self.entry_tx.borrow().clone();
            entry.refetch_in_background(match signal {
                SystemSignal::Focus => "focus",
                SystemSignal::Online => "reconnect",
            });
        }
    }
}

/// Waits for the next key; never resolves for static keys or once the key source is gone.
async fn next_key(key_rx: &mut Option<watch::Receiver<String>>) -> Option<String> {
    let Some(rx) = key_rx else {
        return future::pending().await;
    };
    if rx.changed().await.is_err() {
        // The key can no longer change; keep the last one.
        *key_rx = None;
        return None;
    }
    Some(rx.borrow_and_update().clone())
}
