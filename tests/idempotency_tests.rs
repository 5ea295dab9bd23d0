mod common;

use common::{PayoutReply, PayoutRequest};
use idempotency_engine::error::AppError;
use idempotency_engine::idempotency::{
    fingerprint, IdempotencyHandler, IdempotencyHandlerConfig, IdempotencyStatus, InMemoryRecordStore, RecordStore,
    RequestReply,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOCK_TTL: Duration = Duration::from_secs(5);
const RETENTION_TTL: Duration = Duration::from_secs(60);

fn test_config() -> IdempotencyHandlerConfig {
    IdempotencyHandlerConfig::default()
        .with_lock_ttl(LOCK_TTL)
        .with_retention_ttl(RETENTION_TTL)
}

type PayoutFuture = Pin<Box<dyn Future<Output = Result<PayoutReply, AppError>> + Send>>;
type PayoutOperation = Box<dyn Fn(PayoutRequest) -> PayoutFuture + Send + Sync>;

/// Payout executor over `store` that counts invocations and sleeps for
/// `delay` before replying.
fn payout_executor(
    store: Arc<InMemoryRecordStore>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
) -> RequestReply<InMemoryRecordStore, PayoutOperation> {
    let handler = IdempotencyHandler::with_shared_store(store, test_config());
    let operation: PayoutOperation = Box::new(move |req: PayoutRequest| -> PayoutFuture {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok::<_, AppError>(PayoutReply {
                name: format!("replied:{}", req.name),
            })
        })
    });
    RequestReply::from_handler(handler, operation)
}

#[tokio::test]
async fn test_concurrent_callers_single_execution() {
    let store = Arc::new(InMemoryRecordStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let payout = payout_executor(Arc::clone(&store), Arc::clone(&calls), Duration::from_millis(100));
    let request = PayoutRequest::new("payout-123", "foo");

    let (first, second) = tokio::join!(
        payout.exec("xyz", request.clone()),
        payout.exec("xyz", request.clone()),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.unwrap(), PayoutReply { name: "replied:foo".to_string() });
    assert!(matches!(second, Err(AppError::RequestInFlight)));

    let record = store.load("xyz").await.unwrap().expect("record persisted");
    assert_eq!(record.status, IdempotencyStatus::Success);
    assert_eq!(record.request, fingerprint(&request).unwrap());
    assert_eq!(record.response, Some(serde_json::json!({"name": "replied:foo"})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_once_across_tasks() {
    let store = Arc::new(InMemoryRecordStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let payout = payout_executor(Arc::clone(&store), Arc::clone(&calls), Duration::from_millis(50));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let payout = payout.clone();
        handles.push(tokio::spawn(async move {
            payout.exec("batch-1", PayoutRequest::new("payout-9", "bar")).await
        }));
    }

    let mut replies = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(reply) => {
                assert_eq!(reply.name, "replied:bar");
                replies += 1;
            }
            Err(AppError::RequestInFlight) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(replies >= 1);
}

#[tokio::test]
async fn test_replay_returns_cached_response() {
    let store = Arc::new(InMemoryRecordStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let payout = payout_executor(store, Arc::clone(&calls), Duration::ZERO);
    let request = PayoutRequest::new("payout-1", "alice");

    let first = payout.exec("replay", request.clone()).await.unwrap();
    for _ in 0..3 {
        let again = payout.exec("replay", request.clone()).await.unwrap();
        assert_eq!(again, first);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let snapshot = payout.handler().metrics().snapshot();
    assert_eq!(snapshot.total_requests, 4);
    assert_eq!(snapshot.replayed_requests, 3);
}

#[tokio::test]
async fn test_mismatch_after_success() {
    let store = Arc::new(InMemoryRecordStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let payout = payout_executor(store, Arc::clone(&calls), Duration::ZERO);

    payout.exec("k", PayoutRequest::new("payout-1", "foo")).await.unwrap();
    let err = payout.exec("k", PayoutRequest::new("payout-1", "bar")).await.unwrap_err();

    assert!(matches!(err, AppError::RequestMismatch));
    assert!(!err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mismatch_while_in_flight() {
    let store = Arc::new(InMemoryRecordStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let payout = payout_executor(store, Arc::clone(&calls), Duration::from_millis(100));

    let (first, second) = tokio::join!(
        payout.exec("k", PayoutRequest::new("payout-1", "foo")),
        payout.exec("k", PayoutRequest::new("payout-1", "bar")),
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(AppError::RequestMismatch)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_lock_recovers_after_ttl() {
    let store = Arc::new(InMemoryRecordStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let payout = payout_executor(Arc::clone(&store), Arc::clone(&calls), Duration::ZERO);
    let request = PayoutRequest::new("payout-7", "crash");

    // A holder that acquired the lock and then died without saving or releasing.
    let fp = fingerprint(&request).unwrap();
    assert!(store.acquire_lock("crashed", &fp, LOCK_TTL).await.unwrap());

    let err = payout.exec("crashed", request.clone()).await.unwrap_err();
    assert!(matches!(err, AppError::RequestInFlight));

    tokio::time::advance(LOCK_TTL - Duration::from_millis(1)).await;
    assert!(matches!(
        payout.exec("crashed", request.clone()).await,
        Err(AppError::RequestInFlight)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_millis(1)).await;
    let reply = payout.exec("crashed", request).await.unwrap();
    assert_eq!(reply.name, "replied:crash");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failure_releases_lock_immediately() {
    let store = Arc::new(InMemoryRecordStore::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let handler = IdempotencyHandler::with_shared_store(Arc::clone(&store), test_config());
    let payout = RequestReply::from_handler(handler, move |req: PayoutRequest| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AppError::handler(anyhow::anyhow!("bank timeout")));
            }
            Ok(PayoutReply { name: req.name })
        }
    });
    let request = PayoutRequest::new("payout-2", "retry");

    let err = payout.exec("flaky", request.clone()).await.unwrap_err();
    assert!(matches!(err, AppError::Handler(_)));
    assert!(store.load("flaky").await.unwrap().is_none());

    let reply: PayoutReply = payout.exec("flaky", request).await.unwrap();
    assert_eq!(reply.name, "retry");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let snapshot = payout.handler().metrics().snapshot();
    assert_eq!(snapshot.failed_requests, 1);
    assert_eq!(snapshot.completed_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_forgotten_after_retention() {
    let store = Arc::new(InMemoryRecordStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let payout = payout_executor(Arc::clone(&store), Arc::clone(&calls), Duration::ZERO);
    let request = PayoutRequest::new("payout-3", "old");

    payout.exec("retained", request.clone()).await.unwrap();
    tokio::time::advance(RETENTION_TTL - Duration::from_secs(1)).await;
    payout.exec("retained", request.clone()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(store.load("retained").await.unwrap().is_none());

    // A different payload is accepted once the key has been forgotten.
    let reply = payout.exec("retained", PayoutRequest::new("payout-3", "new")).await.unwrap();
    assert_eq!(reply.name, "replied:new");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_keys_are_independent() {
    let store = Arc::new(InMemoryRecordStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let payout = payout_executor(Arc::clone(&store), Arc::clone(&calls), Duration::ZERO);
    let request = PayoutRequest::new("payout-4", "same");

    payout.exec("a", request.clone()).await.unwrap();
    payout.exec("b", request).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.len().await, 2);
}
