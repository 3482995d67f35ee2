//! Todo list example demonstrating queries, mutations and retries against an in-memory backend.
//!
//! This example shows:
//! - Prefetching a query binding so the first read already holds data
//! - Coalescing: concurrent refetches share one backend call
//! - A mutation that invalidates the list, which then refetches on its own
//! - Refetching when the host reports that the app regained focus
//! - A flaky action wrapped in a retry scope with a fixed backoff
//!
//! Run with: `cargo run --example todos`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use color_eyre::eyre::Result;
use parking_lot::Mutex;
use revalidate::prelude::*;
use revalidate::retry::ActionRetry;
use tracing_subscriber::EnvFilter;

/// A todo item held by the fake backend
#[derive(Debug, Clone)]
struct Todo {
    id: u32,
    title: String,
    completed: bool,
}

/// In-memory stand-in for a remote todo service
#[derive(Clone, Default)]
struct Backend {
    todos: Arc<Mutex<Vec<Todo>>>,
    list_calls: Arc<AtomicUsize>,
    sync_calls: Arc<AtomicUsize>,
}

impl Backend {
    async fn list(&self) -> Result<Vec<Todo>, QueryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.todos.lock().clone())
    }

    async fn create(&self, title: String) -> Result<Todo, QueryError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut todos = self.todos.lock();
        let todo = Todo {
            id: u32::try_from(todos.len()).unwrap_or(u32::MAX) + 1,
            title,
            completed: false,
        };
        todos.push(todo.clone());
        Ok(todo)
    }

    /// Fails twice before succeeding, like a service that is still starting up.
    async fn sync(&self) -> Result<usize, QueryError> {
        let attempt = self.sync_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < 3 {
            return Err(QueryError::NetworkError(format!("attempt {attempt}: connection refused")));
        }
        let mut todos = self.todos.lock();
        for todo in todos.iter_mut() {
            todo.completed = true;
        }
        Ok(todos.len())
    }
}

fn print_todos(label: &str, state: &QueryState<Vec<Todo>, QueryError>) {
    println!("{label}:");
    match (&state.data, &state.error) {
        (_, Some(error)) => println!("  error: {error}"),
        (Some(todos), None) if todos.is_empty() => println!("  (empty)"),
        (Some(todos), None) => {
            for todo in todos {
                let mark = if todo.completed { "x" } else { " " };
                println!("  [{mark}] {} {}", todo.id, todo.title);
            }
        }
        (None, None) => println!("  loading..."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let backend = Backend::default();
    backend.todos.lock().push(Todo {
        id: 1,
        title: "Read the docs".to_string(),
        completed: false,
    });

    let client = QueryClient::with_config(QueryConfig::new(Duration::from_secs(30)));

    // Query: the list of todos, cached under "todos"
    let list_backend = backend.clone();
    let todos = QueryBinding::prefetch(
        &client,
        QueryOptions::new("todos", move || {
            let backend = list_backend.clone();
            async move { backend.list().await }
        }),
    )
    .await?;
    print_todos("After prefetch", &todos.snapshot());

    // Both callers join the same in-flight fetch
    let (first, second) = tokio::join!(todos.refetch(), todos.refetch());
    assert_eq!(first?.len(), second?.len());
    println!("backend list calls so far: {}", backend.list_calls.load(Ordering::SeqCst));

    // Mutation: adding a todo invalidates "todos"
    let create_backend = backend.clone();
    let add_todo = Mutation::new(
        &client,
        MutationOptions::new(move |title: String| {
            let backend = create_backend.clone();
            async move { backend.create(title).await }
        })
        .with_key("todos"),
    );
    let created = add_todo.mutate("Write an example".to_string()).await?;
    println!("created todo #{}: {}", created.id, created.title);

    // The invalidation already started a refetch; this joins it
    todos.refetch().await?;
    print_todos("After mutation", &todos.snapshot());

    // Focus: the host tells bound queries that the app is visible again
    let before = backend.list_calls.load(Ordering::SeqCst);
    client.signals().emit(SystemSignal::Focus);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Fresh again, so this is served from the cache
    todos.refresh().await?;
    println!(
        "list calls caused by focus: {}",
        backend.list_calls.load(Ordering::SeqCst) - before
    );

    // Retry: "sync" is retried in the background with a fixed delay
    let scope = RetryScope::new(RetryConfig::new().with_action(
        "sync",
        ActionRetry::Custom(RetryOptions::new(
            RetryLimit::Count(3),
            RetryDelay::Fixed(Duration::from_millis(50)),
        )),
    ))?;
    let sync_backend = backend.clone();
    let sync_client = client.clone();
    let sync = scope.wrap("sync", move |()| {
        let backend = sync_backend.clone();
        let client = sync_client.clone();
        async move {
            let synced = backend.sync().await?;
            client.invalidate_entry("todos", true);
            Ok::<_, QueryError>(synced)
        }
    });

    if let Err(error) = sync.call(()).await {
        println!("sync failed ({error}), retries pending: {}", scope.pending_retries());
    }
    tokio::time::timeout(Duration::from_secs(1), async {
        while backend.sync_calls.load(Ordering::SeqCst) < 3 || scope.pending_retries() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    println!("sync attempts: {}", backend.sync_calls.load(Ordering::SeqCst));

    todos.refetch().await?;
    print_todos("After sync", &todos.snapshot());

    todos.dispose();
    scope.dispose();
    Ok(())
}
