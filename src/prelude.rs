//! Prelude module for convenient imports.
//!
//! ```
//! use revalidate::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] and [`QueryEntry`] - The cache registry and its entries
//! - [`QueryBinding`] and [`QueryOptions`] - Bound queries
//! - [`Mutation`] and [`MutationOptions`] - Tracked writes
//! - [`RetryScope`] and its configuration types - Retried actions
//! - [`QueryConfig`], [`QueryState`], [`QueryError`] and [`SystemSignal`]

pub use crate::cache::{EntryOptions, QueryClient, QueryEntry};
pub use crate::config::QueryConfig;
pub use crate::error::QueryError;
pub use crate::mutation::{Mutation, MutationKey, MutationOptions};
pub use crate::query::{QueryBinding, QueryKey, QueryOptions};
pub use crate::retry::{RetryConfig, RetryDelay, RetryLimit, RetryOptions, RetryScope};
pub use crate::signal::SystemSignal;
pub use crate::state::QueryState;
