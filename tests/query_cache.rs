// Integration tests for QueryClient and QueryEntry.
// Timing-sensitive tests run on a paused clock; unit tests live in src/cache.rs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use color_eyre::Result;
use revalidate::prelude::*;
use tokio::time::{Duration, advance};
use tracing_subscriber::EnvFilter;

// Helper: show library logs with RUST_LOG=revalidate=debug
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Helper: fetcher that counts its calls and yields the call number
fn counting(calls: &Arc<AtomicUsize>) -> EntryOptions<usize> {
    let counter = Arc::clone(calls);
    EntryOptions::new(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(n) }
    })
}

#[tokio::test]
async fn test_same_key_same_entry() -> Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let a = client.ensure_entry("todos", &counting(&calls))?;
    let b = client.clone().ensure_entry("todos", &counting(&calls))?;
    let other = client.ensure_entry("users", &counting(&calls))?;

    assert!(a.ptr_eq(&b));
    assert!(!a.ptr_eq(&other));
    assert_eq!(client.len(), 2);
    // Creating entries never fetches.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refetches_share_one_call() -> Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = EntryOptions::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, QueryError>("hello".to_string())
        }
    });
    let entry = client.ensure_entry("greeting", &options)?;

    let (a, b, c) = futures::join!(entry.refetch(), entry.refetch(), entry.refresh());

    assert_eq!(a, Ok("hello".to_string()));
    assert_eq!(b, a);
    assert_eq!(c, a);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refresh_respects_cache_time() -> Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = client.ensure_entry(
        "ttl",
        &counting(&calls).with_cache_time(Duration::from_millis(10)),
    )?;

    assert_eq!(entry.refetch().await, Ok(1));

    advance(Duration::from_millis(9)).await;
    assert_eq!(entry.refresh().await, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Exactly cache_time after the last settle counts as expired.
    advance(Duration::from_millis(1)).await;
    assert_eq!(entry.refresh().await, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    advance(Duration::from_millis(11)).await;
    assert_eq!(entry.refresh().await, Ok(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_failed_refetch_keeps_previous_data() -> Result<()> {
    init_tracing();
    let client = QueryClient::new();
    let fail = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&fail);
    let options = EntryOptions::new(move || {
        let failing = flag.load(Ordering::SeqCst) > 0;
        async move {
            if failing {
                Err(QueryError::NetworkError("offline".to_string()))
            } else {
                Ok("hello".to_string())
            }
        }
    });
    let entry = client.ensure_entry("greeting", &options)?;

    assert_eq!(entry.refetch().await, Ok("hello".to_string()));

    fail.store(1, Ordering::SeqCst);
    let err = QueryError::NetworkError("offline".to_string());
    assert_eq!(entry.refetch().await, Err(err.clone()));

    let state = entry.snapshot();
    assert_eq!(state.data, Some("hello".to_string()));
    assert_eq!(state.error, Some(err));
    assert!(!state.is_fetching);
    assert!(state.is_error());

    // A later success clears the error again.
    fail.store(0, Ordering::SeqCst);
    assert_eq!(entry.refetch().await, Ok("hello".to_string()));
    assert_eq!(entry.error(), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_forced_invalidation_refetches_fresh_entry() -> Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = client.ensure_entry(
        "todos",
        &counting(&calls).with_cache_time(Duration::from_secs(1)),
    )?;

    assert_eq!(entry.refetch().await, Ok(1));
    assert!(!entry.is_stale());

    client.invalidate_entry("todos", true);
    assert!(entry.is_fetching());

    // The refresh joins the fetch started by the invalidation.
    assert_eq!(entry.refresh().await, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(entry.data(), Some(2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_forced_invalidation_supersedes_in_flight_fetch() -> Result<()> {
    init_tracing();
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = EntryOptions::new(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            // The first call is the slowest.
            let delay = if n == 1 { 100 } else { 10 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, QueryError>(n)
        }
    });
    let entry = client.ensure_entry("slow", &options)?;

    let first = entry.refetch();
    client.invalidate_entry("slow", true);
    let second = entry.refetch();

    // The superseded caller still gets its own result.
    assert_eq!(first.await, Ok(1));
    assert_eq!(second.await, Ok(2));
    assert_eq!(entry.data(), Some(2));
    assert!(!entry.is_fetching());
    Ok(())
}

#[tokio::test]
async fn test_soft_invalidation_defers_fetch() -> Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = client.ensure_entry(
        "todos",
        &counting(&calls).with_cache_time(Duration::from_secs(60)),
    )?;
    entry.refetch().await.ok();

    client.invalidate_entry("todos", false);
    assert!(entry.is_stale());
    assert!(!entry.is_fetching());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(entry.refresh().await, Ok(2));
    Ok(())
}

#[tokio::test]
async fn test_initial_value_is_visible_before_fetch() -> Result<()> {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let entry = client.ensure_entry("count", &counting(&calls).with_initial_value(|| 0))?;

    assert_eq!(entry.data(), Some(0));
    assert!(entry.is_stale());
    assert_eq!(entry.refresh().await, Ok(1));
    Ok(())
}

#[tokio::test]
async fn test_fetcher_can_inspect_its_own_entry() -> Result<()> {
    let client = QueryClient::new();
    let lookup = client.clone();
    let options = EntryOptions::new(move || {
        // Runs while the entry is fetching; must not block on the entry's state.
        let observed = lookup
            .get_entry::<bool, QueryError>("self-aware")
            .ok()
            .flatten()
            .map(|entry| (entry.is_stale(), entry.pending_for().is_some(), entry.is_fetching()));
        async move { Ok::<_, QueryError>(observed == Some((true, true, true))) }
    });
    let entry = client.ensure_entry("self-aware", &options)?;

    let result = tokio::time::timeout(Duration::from_secs(1), entry.refetch()).await?;
    assert_eq!(result, Ok(true));
    assert!(!entry.is_stale());
    Ok(())
}

#[tokio::test]
async fn test_initial_value_can_use_the_client() -> Result<()> {
    let client = QueryClient::new();
    client.ensure_entry("first", &EntryOptions::new(|| async { Ok::<_, QueryError>(1_usize) }))?;

    let lookup = client.clone();
    let options = EntryOptions::new(|| async { Ok::<_, QueryError>(0_usize) })
        .with_initial_value(move || lookup.len() + usize::from(lookup.has_entry("second")));
    let entry = client.ensure_entry("second", &options)?;

    // Computed before "second" was inserted.
    assert_eq!(entry.data(), Some(1));
    assert_eq!(client.len(), 2);
    Ok(())
}
