// Integration tests for Mutation: call ordering and cache invalidation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use color_eyre::Result;
use parking_lot::Mutex;
use revalidate::prelude::*;
use tokio::sync::oneshot;
use tokio::time::Duration;

async fn flush() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_last_call_wins() -> Result<()> {
    let client = QueryClient::new();
    // Each call waits for its own release signal, so the test controls the settle order.
    let gates: Arc<Mutex<Vec<oneshot::Receiver<()>>>> = Arc::default();
    let pending = Arc::clone(&gates);
    let mutation = Mutation::new(
        &client,
        MutationOptions::new(move |name: &'static str| {
            let gate = pending.lock().remove(0);
            async move {
                gate.await.ok();
                Ok::<_, QueryError>(name)
            }
        }),
    );

    let (release_first, first_gate) = oneshot::channel();
    let (release_second, second_gate) = oneshot::channel();
    gates.lock().extend([first_gate, second_gate]);

    let first = mutation.mutate("first");
    let second = mutation.mutate("second");

    release_second.send(()).ok();
    assert_eq!(second.await, Ok("second"));
    assert_eq!(mutation.data(), Some("second"));
    assert!(!mutation.is_fetching());

    release_first.send(()).ok();
    // The older call still resolves for its own caller...
    assert_eq!(first.await, Ok("first"));
    flush().await;
    // ...but never overwrites the newer state.
    assert_eq!(mutation.data(), Some("second"));
    assert!(!mutation.is_fetching());
    Ok(())
}

#[tokio::test]
async fn test_outdated_call_does_not_invalidate() -> Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let entry = client.ensure_entry(
        "todos",
        &EntryOptions::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, QueryError>(()) }
        })
        .with_cache_time(Duration::from_secs(60)),
    )?;
    entry.refetch().await.ok();

    let mutation = Mutation::new(
        &client,
        MutationOptions::new(|fail: bool| async move {
            if fail {
                Err(QueryError::FetchError("rejected".to_string()))
            } else {
                tokio::task::yield_now().await;
                Ok(())
            }
        })
        .with_key("todos"),
    );

    // The successful call is outdated once the failing one starts.
    let ok = mutation.mutate(false);
    let failed = mutation.mutate(true);
    assert!(failed.await.is_err());
    assert_eq!(ok.await, Ok(()));
    flush().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!entry.is_stale());
    assert!(mutation.error().is_some());
    Ok(())
}

#[tokio::test]
async fn test_success_refetches_bound_queries() -> Result<()> {
    let client = QueryClient::new();
    let todos = Arc::new(Mutex::new(vec!["a".to_string()]));

    let store = Arc::clone(&todos);
    let binding = QueryBinding::prefetch(
        &client,
        QueryOptions::new("todos", move || {
            let snapshot = store.lock().clone();
            async move { Ok::<_, QueryError>(snapshot) }
        })
        .with_cache_time(Duration::from_secs(60)),
    )
    .await?;
    assert_eq!(binding.data(), Some(vec!["a".to_string()]));

    let store = Arc::clone(&todos);
    let add = Mutation::new(
        &client,
        MutationOptions::new(move |title: String| {
            store.lock().push(title.clone());
            async move { Ok::<_, QueryError>(title) }
        })
        .with_key("todos")
        .with_derived_key(|ctx| format!("todo-{}", ctx.result)),
    );

    assert_eq!(add.mutate("b".to_string()).await, Ok("b".to_string()));
    flush().await;
    assert_eq!(
        binding.data(),
        Some(vec!["a".to_string(), "b".to_string()])
    );
    // Derived keys that were never registered are ignored.
    assert!(!client.has_entry("todo-b"));
    Ok(())
}

#[tokio::test]
async fn test_subscribe_reports_progress() -> Result<()> {
    let client = QueryClient::new();
    let mutation = Mutation::new(
        &client,
        MutationOptions::new(|n: u8| async move { Ok::<_, QueryError>(n) }),
    );
    let mut rx = mutation.subscribe();

    let call = mutation.mutate(1);
    assert!(rx.borrow_and_update().is_fetching);

    call.await?;
    rx.changed().await?;
    let state = rx.borrow_and_update().clone();
    assert_eq!(state.data, Some(1));
    assert!(!state.is_fetching);
    Ok(())
}
