//! The cache registry.
//!
//! A [`QueryClient`] maps cache keys to [`QueryEntry`] records. Entries are
//! created lazily the first time a key is used and live as long as the
//! client. The client is an explicitly owned object (one per application or
//! session), so independent clients never share cached data.
//!
//! # Example
//!
//! ```rust
//! use revalidate::cache::{EntryOptions, QueryClient};
//! use revalidate::error::QueryError;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> revalidate::Result<()> {
//! let client = QueryClient::new();
//! let entry = client.ensure_entry(
//!     "user-123",
//!     &EntryOptions::new(|| async { Ok::<_, QueryError>("Ada".to_string()) }),
//! )?;
//!
//! assert_eq!(entry.refresh().await, Ok("Ada".to_string()));
//! // Fresh: served from cache without calling the fetcher again.
//! assert_eq!(entry.refresh().await, Ok("Ada".to_string()));
//! # Ok(())
//! # }
//! ```

mod entry;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::signal::Signals;

pub use entry::{EntryOptions, QueryEntry, QueryFn};

/// Type-erased view of an entry, so the registry can hold entries of any value type.
trait CacheSlot: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn invalidate(&self, force_refresh: bool);
}

impl<T, E> CacheSlot for QueryEntry<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn invalidate(&self, force_refresh: bool) {
        QueryEntry::invalidate(self, force_refresh);
    }
}

/// Owner of every query entry of an application or session.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct QueryClient {
    cache: Arc<DashMap<String, Arc<dyn CacheSlot>>>,
    invalidation_tx: broadcast::Sender<String>,
    signals: Signals,
    config: QueryConfig,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        let (invalidation_tx, _) = broadcast::channel(100);
        Self {
            cache: Arc::new(DashMap::new()),
            invalidation_tx,
            signals: Signals::new(),
            config,
        }
    }

    /// Gets the client-wide query defaults.
    pub const fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Gets the lifecycle signal hub that bound queries listen to.
    pub const fn signals(&self) -> &Signals {
        &self.signals
    }

    /// Returns the entry for `key`, creating it from `options` on first use.
    ///
    /// The same key always yields the same entry. Once a key is registered,
    /// later calls ignore their `options`: the first registration's fetcher,
    /// initial value and cache time stay in effect. If two callers race to
    /// register a key, both may compute an initial value, but only one entry
    /// is kept and returned to both.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTypeMismatch`] if `key` was registered with a
    /// different value or error type.
    pub fn ensure_entry<T, E>(&self, key: &str, options: &EntryOptions<T, E>) -> Result<QueryEntry<T, E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + fmt::Display + 'static,
    {
        let existing = self.cache.get(key).map(|slot| Arc::clone(slot.value()));
        let slot = match existing {
            Some(slot) => slot,
            None => {
                // Built outside the shard lock: `initial_value` may call back into the client.
                let created: Arc<dyn CacheSlot> =
                    Arc::new(QueryEntry::new(key, options, self.config.cache_time));
                let slot = self.cache.entry(key.to_string()).or_insert_with(|| {
                    tracing::debug!(key, "creating query entry");
                    created
                });
                Arc::clone(slot.value())
            }
        };

        downcast(key, slot.as_ref())
    }

    /// Returns the entry for `key` if it was registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTypeMismatch`] if `key` was registered with a
    /// different value or error type.
    pub fn get_entry<T, E>(&self, key: &str) -> Result<Option<QueryEntry<T, E>>>
    where
        T: 'static,
        E: 'static,
    {
        let Some(slot) = self.cache.get(key).map(|slot| Arc::clone(slot.value())) else {
            return Ok(None);
        };
        downcast(key, slot.as_ref()).map(Some)
    }

    /// Returns whether `key` has an entry.
    pub fn has_entry(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Returns the number of registered entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no entry was registered yet.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Returns the registered keys in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.cache.iter().map(|slot| slot.key().clone()).collect()
    }

    /// Marks the entry for `key` as stale so that its next refresh fetches.
    ///
    /// With `force_refresh`, any in-flight fetch is abandoned and a new one is
    /// started in the background. Unknown keys are ignored.
    pub fn invalidate_entry(&self, key: &str, force_refresh: bool) {
        let Some(slot) = self.cache.get(key).map(|slot| Arc::clone(slot.value())) else {
            tracing::trace!(key, "nothing to invalidate");
            return;
        };

        tracing::debug!(key, force_refresh, "invalidating query entry");
        slot.invalidate(force_refresh);
        let _ = self.invalidation_tx.send(key.to_string());
    }

    /// Subscribes to the keys of invalidated entries.
    pub fn subscribe_invalidation(&self) -> broadcast::Receiver<String> {
        self.invalidation_tx.subscribe()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &self.cache.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn downcast<T: 'static, E: 'static>(key: &str, slot: &dyn CacheSlot) -> Result<QueryEntry<T, E>> {
    slot.as_any()
        .downcast_ref::<QueryEntry<T, E>>()
        .cloned()
        .ok_or_else(|| Error::KeyTypeMismatch {
            key: key.to_string(),
        })
}
