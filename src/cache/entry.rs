use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::state::QueryState;
use crate::task::{SharedTask, shared_task};

/// The user supplied fetcher behind an entry.
pub type QueryFn<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

type InitialValueFn<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// How an entry is created on first use of its key.
pub struct EntryOptions<T, E = QueryError> {
    pub(crate) query: QueryFn<T, E>,
    pub(crate) initial_value: Option<InitialValueFn<T>>,
    pub(crate) cache_time: Option<Duration>,
}

impl<T, E> EntryOptions<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates options around an async fetcher.
    ///
    /// ```
    /// use revalidate::cache::EntryOptions;
    /// use revalidate::error::QueryError;
    ///
    /// let options = EntryOptions::new(|| async { Ok::<_, QueryError>(42) });
    /// ```
    pub fn new<F, Fut>(query: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            query: Arc::new(move || query().boxed()),
            initial_value: None,
            cache_time: None,
        }
    }
}

impl<T, E> EntryOptions<T, E> {
    /// Computes the data exposed before the first fetch settles.
    #[must_use]
    pub fn with_initial_value(mut self, initial: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.initial_value = Some(Arc::new(initial));
        self
    }

    /// Overrides the client-wide cache time for this entry.
    #[must_use]
    pub const fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }
}

impl<T, E> Clone for EntryOptions<T, E> {
    fn clone(&self) -> Self {
        Self {
            query: Arc::clone(&self.query),
            initial_value: self.initial_value.clone(),
            cache_time: self.cache_time,
        }
    }
}

impl<T, E> fmt::Debug for EntryOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryOptions")
            .field("initial_value", &self.initial_value.is_some())
            .field("cache_time", &self.cache_time)
            .finish_non_exhaustive()
    }
}

struct Pending<T, E> {
    id: u64,
    call: SharedTask<Result<T, E>>,
    started_at: Instant,
}

struct Timing<T, E> {
    /// Last settle time; `None` forces the next `refresh` to fetch.
    when: Option<Instant>,
    pending: Option<Pending<T, E>>,
    next_id: u64,
}

struct Inner<T, E> {
    key: String,
    query: QueryFn<T, E>,
    cache_time: Duration,
    state: watch::Sender<QueryState<T, E>>,
    timing: Mutex<Timing<T, E>>,
}

/// A registry record for one cache key.
///
/// Entries are handed out by [`QueryClient::ensure_entry`](super::QueryClient::ensure_entry)
/// and are cheap handles: clones share the same state, and the registry hands
/// out the same entry for the same key for the lifetime of the client.
///
/// At most one call to the fetcher is in flight per entry. Concurrent
/// [`refetch`](Self::refetch) and [`refresh`](Self::refresh) callers join it
/// and observe the same outcome.
///
/// All methods that may start a fetch must be called from within a Tokio
/// runtime: the fetch is driven by a spawned task so that its outcome is
/// recorded even if the caller drops the returned future.
pub struct QueryEntry<T, E = QueryError> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for QueryEntry<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for QueryEntry<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEntry")
            .field("key", &self.inner.key)
            .field("cache_time", &self.inner.cache_time)
            .finish_non_exhaustive()
    }
}

impl<T, E> QueryEntry<T, E> {
    /// Returns the cache key of this entry.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Returns how long a settled fetch stays fresh.
    pub fn cache_time(&self) -> Duration {
        self.inner.cache_time
    }

    /// Returns `true` if both handles refer to the same registry record.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns whether a fetch is currently in flight.
    pub fn is_fetching(&self) -> bool {
        self.inner.state.borrow().is_fetching
    }

    /// Returns whether the next [`refresh`](Self::refresh) would call the fetcher.
    pub fn is_stale(&self) -> bool {
        let timing = self.inner.timing.lock();
        is_expired(timing.when, self.inner.cache_time, Instant::now())
    }

    /// Returns how long the in-flight fetch has been running, if any.
    pub fn pending_for(&self) -> Option<Duration> {
        let timing = self.inner.timing.lock();
        timing.pending.as_ref().map(|pending| pending.started_at.elapsed())
    }

    /// Subscribes to state changes.
    ///
    /// The receiver starts out with the current state marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T, E>> {
        self.inner.state.subscribe()
    }
}

impl<T, E> QueryEntry<T, E>
where
    T: Clone,
    E: Clone,
{
    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> QueryState<T, E> {
        self.inner.state.borrow().clone()
    }

    /// Returns the last known data.
    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    /// Returns the error of the last settled fetch.
    pub fn error(&self) -> Option<E> {
        self.inner.state.borrow().error.clone()
    }
}

impl<T, E> QueryEntry<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    pub(crate) fn new(key: &str, options: &EntryOptions<T, E>, default_cache_time: Duration) -> Self {
        let data = options.initial_value.as_ref().map(|initial| initial());
        let (state, _rx) = watch::channel(QueryState::new(data));
        Self {
            inner: Arc::new(Inner {
                key: key.to_string(),
                query: Arc::clone(&options.query),
                cache_time: options.cache_time.unwrap_or(default_cache_time),
                state,
                timing: Mutex::new(Timing {
                    when: None,
                    pending: None,
                    next_id: 0,
                }),
            }),
        }
    }

    /// Fetches regardless of freshness, joining the in-flight fetch if there is one.
    ///
    /// The fetch is spawned right away and `is_fetching` is set before this
    /// returns; the returned future only observes it. The fetcher itself is
    /// called from the spawned task, never while the entry is locked.
    /// On failure the previous data is kept and the error is both stored and
    /// returned.
    pub fn refetch(&self) -> BoxFuture<'static, Result<T, E>> {
        self.start_fetch().boxed()
    }

    /// Fetches only if the entry expired, otherwise resolves with the cached data.
    ///
    /// An in-flight fetch is joined rather than duplicated. If the entry is
    /// fresh but its last fetch failed without ever producing data, the cached
    /// error is returned instead.
    pub fn refresh(&self) -> BoxFuture<'static, Result<T, E>> {
        {
            let timing = self.inner.timing.lock();
            if let Some(pending) = &timing.pending {
                return pending.call.clone().boxed();
            }
            if !is_expired(timing.when, self.inner.cache_time, Instant::now()) {
                let state = self.inner.state.borrow();
                match (&state.data, &state.error) {
                    (Some(data), _) => return future::ready(Ok(data.clone())).boxed(),
                    (None, Some(error)) => return future::ready(Err(error.clone())).boxed(),
                    (None, None) => {}
                }
            }
        }
        self.refetch()
    }

    /// Starts a refetch whose failure is logged instead of returned.
    pub(crate) fn refetch_in_background(&self, trigger: &'static str) {
        let call = self.refetch();
        self.observe_in_background(call, trigger);
    }

    /// Starts a refresh whose failure is logged instead of returned.
    pub(crate) fn refresh_in_background(&self, trigger: &'static str) {
        let call = self.refresh();
        self.observe_in_background(call, trigger);
    }

    /// Forces the next refresh to fetch, optionally replacing any in-flight fetch right away.
    pub(crate) fn invalidate(&self, force_refresh: bool) {
        {
            let mut timing = self.inner.timing.lock();
            timing.when = None;
            if force_refresh {
                timing.pending = None;
            }
        }
        if force_refresh {
            self.refetch_in_background("invalidate");
        }
    }

    fn start_fetch(&self) -> SharedTask<Result<T, E>> {
        let mut timing = self.inner.timing.lock();
        if let Some(pending) = &timing.pending {
            tracing::trace!(key = %self.inner.key, "joining in-flight fetch");
            return pending.call.clone();
        }

        timing.next_id += 1;
        let id = timing.next_id;
        self.inner.state.send_modify(|state| state.is_fetching = true);
        tracing::debug!(key = %self.inner.key, id, "fetch started");

        // The fetcher runs on the task, after the lock is released, so it may
        // inspect this entry.
        let inner = Arc::clone(&self.inner);
        let task = shared_task(async move {
            let result = (inner.query)().await;
            inner.settle(id, &result);
            result
        });
        timing.pending = Some(Pending {
            id,
            call: task.clone(),
            started_at: Instant::now(),
        });
        drop(timing);

        tokio::spawn(task.clone());
        task
    }

    fn observe_in_background(&self, call: BoxFuture<'static, Result<T, E>>, trigger: &'static str) {
        let key = self.inner.key.clone();
        tokio::spawn(async move {
            if let Err(error) = call.await {
                tracing::warn!(%key, trigger, %error, "background fetch failed");
            }
        });
    }
}

impl<T, E> Inner<T, E>
where
    T: Clone,
    E: Clone,
{
    fn settle(&self, id: u64, result: &Result<T, E>) {
        let mut timing = self.timing.lock();
        if timing.pending.as_ref().map(|pending| pending.id) != Some(id) {
            // Replaced by a forced invalidation; the newer fetch owns the state.
            tracing::debug!(key = %self.key, id, "discarding superseded fetch");
            return;
        }
        timing.pending = None;
        timing.when = Some(Instant::now());

        self.state.send_modify(|state| {
            state.is_fetching = false;
            match result {
                Ok(data) => {
                    state.data = Some(data.clone());
                    state.error = None;
                }
                Err(error) => state.error = Some(error.clone()),
            }
        });
        tracing::debug!(key = %self.key, id, ok = result.is_ok(), "fetch settled");
    }
}

fn is_expired(when: Option<Instant>, cache_time: Duration, now: Instant) -> bool {
    when.is_none_or(|when| now.saturating_duration_since(when) >= cache_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_entry(cache_time: Duration) -> (QueryEntry<usize, QueryError>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let options = EntryOptions::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n) }
        });
        (QueryEntry::new("counter", &options, cache_time), calls)
    }

    #[test]
    fn test_is_expired() {
        let now = Instant::now();
        let ttl = Duration::from_millis(10);
        assert!(is_expired(None, ttl, now));
        assert!(!is_expired(Some(now), ttl, now + Duration::from_millis(9)));
        assert!(is_expired(Some(now), ttl, now + Duration::from_millis(10)));
        assert!(is_expired(Some(now), Duration::ZERO, now));
    }

    #[tokio::test]
    async fn test_new_entry_state() {
        let options = EntryOptions::new(|| async { Ok::<_, QueryError>(1) })
            .with_initial_value(|| 0)
            .with_cache_time(Duration::from_secs(1));
        let entry = QueryEntry::new("key", &options, Duration::from_secs(5));

        assert_eq!(entry.key(), "key");
        assert_eq!(entry.cache_time(), Duration::from_secs(1));
        assert_eq!(entry.data(), Some(0));
        assert_eq!(entry.error(), None);
        assert!(!entry.is_fetching());
        assert!(entry.is_stale());
        assert!(entry.pending_for().is_none());
    }

    #[tokio::test]
    async fn test_refetch_sets_fetching_before_settling() {
        let (entry, calls) = counting_entry(Duration::from_secs(1));

        let call = entry.refetch();
        assert!(entry.is_fetching());
        assert!(entry.pending_for().is_some());

        assert_eq!(call.await, Ok(1));
        assert!(!entry.is_fetching());
        assert!(!entry.is_stale());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_joins_pending_fetch() {
        let (entry, calls) = counting_entry(Duration::from_secs(1));

        let first = entry.refetch();
        let second = entry.refresh();
        assert_eq!(futures::join!(first, second), (Ok(1), Ok(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_marks_stale() {
        let (entry, calls) = counting_entry(Duration::from_secs(60));
        assert_eq!(entry.refetch().await, Ok(1));
        assert!(!entry.is_stale());

        entry.invalidate(false);
        assert!(entry.is_stale());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(entry.refresh().await, Ok(2));
    }

    #[tokio::test]
    async fn test_fresh_failure_is_served_from_cache() {
        let options = EntryOptions::new(|| async {
            Err::<i32, _>(QueryError::FetchError("down".to_string()))
        })
        .with_cache_time(Duration::from_secs(60));
        let entry = QueryEntry::new("broken", &options, Duration::from_secs(5));

        let err = QueryError::FetchError("down".to_string());
        assert_eq!(entry.refetch().await, Err(err.clone()));
        assert_eq!(entry.refresh().await, Err(err.clone()));
        assert_eq!(entry.error(), Some(err));
        assert_eq!(entry.data(), None);
    }

    #[tokio::test]
    async fn test_subscribe_sees_settled_state() {
        let (entry, _calls) = counting_entry(Duration::from_secs(1));
        let mut rx = entry.subscribe();

        entry.refetch().await.ok();
        assert!(rx.has_changed().unwrap_or(false));
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.data, Some(1));
        assert!(!state.is_fetching);
    }
}
