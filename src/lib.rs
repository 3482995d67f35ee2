//! # Revalidate - keyed query cache for async Rust
//!
//! Revalidate caches the results of async fetchers per string key, in the
//! spirit of SWR or TanStack Query. It deduplicates concurrent fetches,
//! tracks freshness with a time-to-live, keeps showing stale data while
//! revalidating, and publishes `data` / `error` / `is_fetching` state that
//! UIs can observe.
//!
//! ## Architecture
//!
//! 1. **Cache registry**: a [`QueryClient`](cache::QueryClient) owns one
//!    [`QueryEntry`](cache::QueryEntry) per key, coalesces fetches and
//!    enforces expiration.
//! 2. **Query bindings**: a [`QueryBinding`](query::QueryBinding) binds a
//!    call site to the entry of a (possibly changing) key and refetches on
//!    mount, key changes, focus and reconnection.
//! 3. **Mutations**: a [`Mutation`](mutation::Mutation) tracks a write
//!    operation and invalidates related keys when it succeeds.
//! 4. **Retries**: a [`RetryScope`](retry::RetryScope) re-runs failed named
//!    actions with configurable backoff.
//!
//! ## Example
//!
//! ```rust
//! use revalidate::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> revalidate::Result<()> {
//! let client = QueryClient::new();
//!
//! let todos = QueryBinding::prefetch(
//!     &client,
//!     QueryOptions::new("todos", || async { Ok::<_, QueryError>(vec!["write docs"]) }),
//! )
//! .await?;
//! assert_eq!(todos.data(), Some(vec!["write docs"]));
//!
//! let add = Mutation::new(
//!     &client,
//!     MutationOptions::new(|title: String| async move { Ok::<_, QueryError>(title) })
//!         .with_key("todos"),
//! );
//! add.mutate("ship it".to_string()).await.ok();
//! // "todos" was invalidated and is being refetched in the background.
//! # Ok(())
//! # }
//! ```
//!
//! All operations that start fetches spawn Tokio tasks and must run inside a
//! Tokio runtime.

pub mod cache;
pub mod config;
pub mod error;
pub mod mutation;
pub mod prelude;
pub mod query;
pub mod retry;
pub mod signal;
pub mod state;

mod task;

pub use error::{Error, Result};
