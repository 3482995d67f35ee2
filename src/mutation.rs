//! Mutations: tracked write operations that invalidate cached queries.
//!
//! Unlike queries, mutations are never cached. A [`Mutation`] wraps a user
//! supplied async write, exposes its `data`/`error`/`is_fetching` state and,
//! after a successful call, invalidates (and refetches) the query entries
//! named by its keys.
//!
//! # Last call wins
//!
//! Every [`Mutation::mutate`] call is tagged with a generation. Only the most
//! recently started call may update the observable state or invalidate keys;
//! an older call settling later is ignored, whatever order the calls finish
//! in. Each caller still receives its own call's result.
//!
//! # Example
//!
//! ```rust
//! use revalidate::cache::QueryClient;
//! use revalidate::error::QueryError;
//! use revalidate::mutation::{Mutation, MutationOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = QueryClient::new();
//!
//! let rename = Mutation::new(
//!     &client,
//!     MutationOptions::new(|(id, name): (u32, String)| async move {
//!         Ok::<_, QueryError>(format!("{id}:{name}"))
//!     })
//!     .with_key("users")
//!     .with_derived_key(|ctx| format!("user-{}", ctx.variables.0)),
//! );
//!
//! let saved = rename.mutate((7, "Ada".to_string())).await;
//! assert_eq!(saved, Ok("7:Ada".to_string()));
//! assert_eq!(rename.data(), Some("7:Ada".to_string()));
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::cache::QueryClient;
use crate::error::QueryError;
use crate::state::QueryState;
use crate::task::spawn_shared;

/// Observable state of a mutation.
pub type MutationState<T, E> = QueryState<T, E>;

/// The user supplied write operation.
pub type MutationFn<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

type KeyFn<A, T> = Arc<dyn Fn(&MutationContext<'_, A, T>) -> String + Send + Sync>;

/// What a successful mutation call knew when resolving its keys.
#[derive(Debug)]
pub struct MutationContext<'a, A, T> {
    /// The arguments passed to [`Mutation::mutate`].
    pub variables: &'a A,
    /// The value the mutation resolved with.
    pub result: &'a T,
}

/// A cache key invalidated after a successful mutation.
pub enum MutationKey<A, T> {
    /// A fixed key.
    Static(String),
    /// A key computed from the call's arguments and result.
    Derived(KeyFn<A, T>),
}

impl<A, T> MutationKey<A, T> {
    /// Computes the key from the call's arguments and result.
    pub fn derived(f: impl Fn(&MutationContext<'_, A, T>) -> String + Send + Sync + 'static) -> Self {
        Self::Derived(Arc::new(f))
    }

    fn resolve(&self, context: &MutationContext<'_, A, T>) -> String {
        match self {
            Self::Static(key) => key.clone(),
            Self::Derived(f) => f(context),
        }
    }
}

impl<A, T> From<&str> for MutationKey<A, T> {
    fn from(key: &str) -> Self {
        Self::Static(key.to_string())
    }
}

impl<A, T> From<String> for MutationKey<A, T> {
    fn from(key: String) -> Self {
        Self::Static(key)
    }
}

impl<A, T> fmt::Debug for MutationKey<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(key) => f.debug_tuple("Static").field(key).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Options of a [`Mutation`].
pub struct MutationOptions<A, T, E = QueryError> {
    mutation: MutationFn<A, T, E>,
    keys: Vec<MutationKey<A, T>>,
}

impl<A, T, E> MutationOptions<A, T, E>
where
    A: 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates options around an async write operation.
    pub fn new<F, Fut>(mutation: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            mutation: Arc::new(move |variables| mutation(variables).boxed()),
            keys: Vec::new(),
        }
    }
}

impl<A, T, E> MutationOptions<A, T, E> {
    /// Adds a key to invalidate, with a forced refetch, after each successful call.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<MutationKey<A, T>>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Adds a key computed from each successful call's arguments and result.
    #[must_use]
    pub fn with_derived_key(
        self,
        f: impl Fn(&MutationContext<'_, A, T>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.with_key(MutationKey::derived(f))
    }

    /// Adds several keys to invalidate after each successful call.
    #[must_use]
    pub fn with_keys<K>(mut self, keys: impl IntoIterator<Item = K>) -> Self
    where
        K: Into<MutationKey<A, T>>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }
}

struct Inner<A, T, E> {
    client: QueryClient,
    mutation: MutationFn<A, T, E>,
    keys: Vec<MutationKey<A, T>>,
    state: watch::Sender<MutationState<T, E>>,
    generation: AtomicU64,
}

/// A tracked write operation.
///
/// Cloning yields another handle to the same mutation state.
pub struct Mutation<A, T, E = QueryError> {
    inner: Arc<Inner<A, T, E>>,
}

impl<A, T, E> Clone for Mutation<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> Mutation<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    /// Creates a mutation whose invalidations go to `client`.
    pub fn new(client: &QueryClient, options: MutationOptions<A, T, E>) -> Self {
        let (state, _rx) = watch::channel(MutationState::default());
        Self {
            inner: Arc::new(Inner {
                client: client.clone(),
                mutation: options.mutation,
                keys: options.keys,
                state,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Runs the mutation with `variables`.
    ///
    /// The call starts immediately, and `is_fetching` is set before this
    /// returns. The returned future resolves with this call's own outcome;
    /// errors are always returned to the caller.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn mutate(&self, variables: A) -> BoxFuture<'static, Result<T, E>> {
        let mut generation = 0;
        self.inner.state.send_modify(|state| {
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            state.is_fetching = true;
            state.error = None;
        });

        let call = (self.inner.mutation)(variables.clone());
        let inner = Arc::clone(&self.inner);
        spawn_shared(async move {
            let result = call.await;
            inner.settle(generation, &variables, &result);
            result
        })
        .boxed()
    }
}

impl<A, T, E> Mutation<A, T, E>
where
    T: Clone,
    E: Clone,
{
    /// Returns the result of the latest successful call.
    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    /// Returns the error of the latest call, if it failed.
    pub fn error(&self) -> Option<E> {
        self.inner.state.borrow().error.clone()
    }

    /// Returns whether the latest call is still running.
    pub fn is_fetching(&self) -> bool {
        self.inner.state.borrow().is_fetching
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> MutationState<T, E> {
        self.inner.state.borrow().clone()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<MutationState<T, E>> {
        self.inner.state.subscribe()
    }
}

impl<A, T, E> fmt::Debug for Mutation<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("keys", &self.inner.keys)
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<A, T, E> Inner<A, T, E>
where
    A: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    fn settle(&self, generation: u64, variables: &A, result: &Result<T, E>) {
        let latest = self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            state.is_fetching = false;
            match result {
                Ok(data) => {
                    state.data = Some(data.clone());
                    state.error = None;
                }
                Err(error) => state.error = Some(error.clone()),
            }
            true
        });

        if !latest {
            tracing::debug!(generation, "ignoring outdated mutation result");
            return;
        }

        match result {
            Ok(data) => {
                let context = MutationContext {
                    variables,
                    result: data,
                };
                for key in &self.keys {
                    self.client.invalidate_entry(&key.resolve(&context), true);
                }
            }
            Err(error) => tracing::debug!(generation, %error, "mutation failed"),
        }
    }
}
