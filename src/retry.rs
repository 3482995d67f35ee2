//! Automatic retries for failed actions.
//!
//! A [`RetryScope`] owns the retry state of a group of named actions (think
//! of one store instance). Actions are wrapped with [`RetryScope::wrap`];
//! calling the wrapped action is a *manual* invocation, while re-invocations
//! issued by the scope's timers are *scheduled* ones.
//!
//! # State machine
//!
//! Per action name:
//!
//! - Every invocation starts an attempt.
//! - A manual invocation first cancels any scheduled retry and resets the
//!   retry count to 0, so the backoff sequence starts over.
//! - On failure, the [`RetryLimit`] is asked with the current count and the
//!   error. If it allows another attempt, a re-invocation with the same
//!   arguments is scheduled after [`RetryDelay::for_attempt`] of the current
//!   count, and the count is incremented. Otherwise the action's retry state
//!   is discarded.
//! - On success the action's retry state is discarded.
//!
//! The manual caller only ever sees the outcome of its own attempt; the
//! outcomes of scheduled attempts are logged. Disposing the scope (or dropping
//! its last handle) cancels every scheduled retry.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use revalidate::error::QueryError;
//! use revalidate::retry::{RetryConfig, RetryDelay, RetryLimit, RetryOptions, RetryScope};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> revalidate::Result<()> {
//! let scope = RetryScope::new(
//!     RetryConfig::new()
//!         .with_defaults(RetryOptions::new(RetryLimit::Count(2), RetryDelay::Fixed(Duration::from_millis(10))))
//!         .enable("load"),
//! )?;
//!
//! let load = scope.wrap("load", |page: u32| async move {
//!     Err::<Vec<String>, _>(QueryError::NetworkError(format!("page {page} unavailable")))
//! });
//!
//! assert!(load.call(1).await.is_err());
//! assert_eq!(scope.pending_retries(), 1);
//!
//! scope.dispose();
//! assert_eq!(scope.pending_retries(), 0);
//! # Ok(())
//! # }
//! ```

mod config;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::task::spawn_shared;

pub use config::{ActionRetry, RetryConfig, RetryDelay, RetryLimit, RetryOptions};

type ActionFn<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, std::result::Result<T, E>> + Send + Sync>;

#[derive(Debug)]
struct RetryEntry {
    retry_count: u32,
    /// Tells an entry apart from one recreated after a reset.
    epoch: u64,
    /// Cancels the scheduled retry, if one is waiting.
    timer: Option<CancellationToken>,
}

#[derive(Debug)]
struct ScopeInner {
    config: RetryConfig,
    entries: Mutex<HashMap<String, RetryEntry>>,
    next_epoch: AtomicU64,
    token: CancellationToken,
}

impl ScopeInner {
    fn new_entry(&self) -> RetryEntry {
        RetryEntry {
            retry_count: 0,
            epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
            timer: None,
        }
    }

    /// Returns `(retry_count, epoch)` of `action`, if it has retry state.
    fn observe(&self, action: &str) -> Option<(u32, u64)> {
        self.entries
            .lock()
            .get(action)
            .map(|entry| (entry.retry_count, entry.epoch))
    }

    /// Cancels the scheduled retry of `action` and forgets its count.
    fn reset(&self, action: &str) {
        if let Some(entry) = self.entries.lock().remove(action) {
            if let Some(timer) = entry.timer {
                tracing::debug!(action, retry_count = entry.retry_count, "retry cancelled by manual call");
                timer.cancel();
            }
        }
    }

    fn clear(&self) {
        for (_, entry) in self.entries.lock().drain() {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Retry state for a group of named actions.
///
/// Cloning yields another handle to the same scope.
#[derive(Debug, Clone)]
pub struct RetryScope {
    inner: Arc<ScopeInner>,
}

impl RetryScope {
    /// Creates a scope after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRetryConfig`](crate::Error::InvalidRetryConfig)
    /// if the configuration is rejected by [`RetryConfig::validate`].
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ScopeInner {
                config,
                entries: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
                token: CancellationToken::new(),
            }),
        })
    }

    /// Wraps `action` under `name`.
    ///
    /// Actions that the configuration doesn't enable are passed through
    /// without retries.
    pub fn wrap<A, T, E, F, Fut>(&self, name: impl Into<String>, action: F) -> RetryAction<A, T, E>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        A: 'static,
        T: 'static,
        E: 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let options = self.inner.config.options_for(&name).cloned().map(Arc::new);
        if options.is_none() {
            tracing::trace!(action = %name, "action registered without retries");
        }
        RetryAction {
            name,
            action: Arc::new(move |args| action(args).boxed()),
            options,
            scope: Arc::downgrade(&self.inner),
        }
    }

    /// Returns the number of retries currently waiting for their delay.
    pub fn pending_retries(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|entry| entry.timer.is_some())
            .count()
    }

    /// Returns how many retries `action` made since its last manual call, if it is failing.
    pub fn retry_count(&self, action: &str) -> Option<u32> {
        self.inner
            .entries
            .lock()
            .get(action)
            .map(|entry| entry.retry_count)
    }

    /// Cancels every scheduled retry; later failures are no longer retried.
    pub fn dispose(&self) {
        self.inner.token.cancel();
        self.inner.clear();
    }

    /// Returns whether the scope was disposed or dropped.
    pub fn is_disposed(&self) -> bool {
        self.inner.token.is_cancelled()
    }
}

/// An action wrapped by a [`RetryScope`].
pub struct RetryAction<A, T, E> {
    name: Arc<str>,
    action: ActionFn<A, T, E>,
    options: Option<Arc<RetryOptions>>,
    scope: Weak<ScopeInner>,
}

impl<A, T, E> Clone for RetryAction<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            action: Arc::clone(&self.action),
            options: self.options.clone(),
            scope: Weak::clone(&self.scope),
        }
    }
}

impl<A, T, E> fmt::Debug for RetryAction<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAction")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<A, T, E> RetryAction<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: StdError + Clone + Send + Sync + 'static,
{
    /// Returns the action name used for configuration lookup.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the action manually.
    ///
    /// Cancels a scheduled retry of this action and restarts its retry count
    /// before running. The attempt starts immediately; the returned future
    /// resolves with this attempt's outcome only.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn call(&self, args: A) -> BoxFuture<'static, std::result::Result<T, E>> {
        if let Some(scope) = self.scope.upgrade() {
            scope.reset(&self.name);
        }
        self.invoke(args)
    }

    fn invoke(&self, args: A) -> BoxFuture<'static, std::result::Result<T, E>> {
        let call = (self.action)(args.clone());
        let Some(options) = self.options.clone() else {
            return spawn_shared(call).boxed();
        };

        let this = self.clone();
        spawn_shared(async move {
            let result = call.await;
            match &result {
                Ok(_) => this.on_success(),
                Err(error) => this.on_failure(args, error, &options),
            }
            result
        })
        .boxed()
    }

    fn on_success(&self) {
        if let Some(scope) = self.scope.upgrade() {
            scope.entries.lock().remove(&*self.name);
        }
    }

    fn on_failure(&self, args: A, error: &E, options: &RetryOptions) {
        let Some(scope) = self.scope.upgrade() else {
            return;
        };
        if scope.token.is_cancelled() {
            return;
        }

        // Retry policies are user code: decide without holding the lock, then
        // apply only if the action's retry state is still the one observed.
        let observed = scope.observe(&self.name);
        let count = observed.map_or(0, |(count, _)| count);
        let delay = options
            .retry
            .allows(count, error)
            .then(|| options.delay.for_attempt(count));

        let (delay, timer) = {
            let mut entries = scope.entries.lock();
            let current = entries
                .get(&*self.name)
                .map(|entry| (entry.retry_count, entry.epoch));
            if current != observed || scope.token.is_cancelled() {
                tracing::debug!(action = %self.name, "retry state changed while deciding, skipping");
                return;
            }
            let Some(delay) = delay else {
                tracing::debug!(action = %self.name, retry_count = count, %error, "giving up");
                entries.remove(&*self.name);
                return;
            };

            let timer = scope.token.child_token();
            let entry = entries
                .entry(self.name.to_string())
                .or_insert_with(|| scope.new_entry());
            if let Some(previous) = entry.timer.replace(timer.clone()) {
                previous.cancel();
            }
            entry.retry_count += 1;
            tracing::debug!(action = %self.name, attempt = count + 1, ?delay, %error, "retry scheduled");
            (delay, timer)
        };

        // The deadline counts from the failure, not from when the timer task first runs.
        let sleep = tokio::time::sleep(delay);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = timer.cancelled() => {}
                () = sleep => this.run_scheduled(args, &timer).await,
            }
        });
    }

    async fn run_scheduled(&self, args: A, timer: &CancellationToken) {
        if let Some(scope) = self.scope.upgrade() {
            let mut entries = scope.entries.lock();
            match entries.get_mut(&*self.name) {
                // A replaced or reset timer is always cancelled first.
                Some(entry) if entry.timer.is_some() && !timer.is_cancelled() => entry.timer = None,
                _ => return,
            }
        }

        if let Err(error) = self.invoke(args).await {
            tracing::warn!(action = %self.name, %error, "scheduled retry failed");
        }
    }
}
