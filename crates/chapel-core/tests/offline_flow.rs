//! End-to-end flows through the interceptor, queue and sync engine,
//! backed by an in-memory store and the mock transport.

use std::sync::Arc;

use chapel_core::{
    CacheStore, Connectivity, Error, HttpResponse, InterceptorConfig, MockTransport,
    NetworkInterceptor, OperationQueue, RequestOptions, SharedStore, SyncConfig, SyncEngine,
};
use chapel_store::Store;
use chapel_types::HttpMethod;
use serde_json::json;

struct Stack {
    interceptor: NetworkInterceptor,
    engine: SyncEngine,
    queue: Arc<OperationQueue>,
    mock: Arc<MockTransport>,
    connectivity: Connectivity,
}

fn stack() -> Stack {
    let store: SharedStore = Arc::new(tokio::sync::Mutex::new(Store::open_in_memory().unwrap()));
    let mock = Arc::new(MockTransport::new());
    let connectivity = Connectivity::new(true);
    let cache = CacheStore::new(store.clone());
    let queue = Arc::new(OperationQueue::new(store.clone(), mock.clone()));
    let interceptor = NetworkInterceptor::new(
        InterceptorConfig::default(),
        mock.clone(),
        cache.clone(),
        queue.clone(),
        connectivity.clone(),
    );
    let engine = SyncEngine::new(
        queue.clone(),
        cache,
        store,
        connectivity.clone(),
        SyncConfig::default(),
    );
    Stack {
        interceptor,
        engine,
        queue,
        mock,
        connectivity,
    }
}

#[tokio::test]
async fn test_fallback_after_network_loss() {
    let s = stack();
    let events = json!([{"id": 1, "title": "Vespers"}]);
    s.mock
        .respond(HttpMethod::Get, "/api/events", HttpResponse::json(200, &events))
        .await;

    s.interceptor
        .request("/api/events", RequestOptions::get())
        .await
        .unwrap();

    // Link still reported up, but the backend is unreachable.
    s.mock.set_offline(true);
    let resp = s
        .interceptor
        .request("/api/events", RequestOptions::get())
        .await
        .unwrap();
    assert!(resp.from_cache);
    assert_eq!(resp.data, events);

    let err = s
        .interceptor
        .request("/api/churches", RequestOptions::get())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DataUnavailable { .. }));
}

#[tokio::test]
async fn test_offline_edits_replay_by_priority() {
    let s = stack();
    s.connectivity.set_online(false);

    s.interceptor
        .request("/api/tasks/1", RequestOptions::put(json!({"status": "done"})))
        .await
        .unwrap();
    s.interceptor
        .request("/api/analytics/view", RequestOptions::post(json!({"page": "home"})))
        .await
        .unwrap();
    s.interceptor
        .request("/api/users/9", RequestOptions::patch(json!({"name": "B"})))
        .await
        .unwrap();
    assert_eq!(s.queue.len().await.unwrap(), 3);

    s.mock.set_fallback(HttpResponse::new(204)).await;
    s.connectivity.set_online(true);
    let outcome = s.engine.sync_now().await;
    assert_eq!(outcome.succeeded, 3);

    let order: Vec<String> = s.mock.requests().await.into_iter().map(|r| r.url).collect();
    assert_eq!(order, vec!["/api/users/9", "/api/tasks/1", "/api/analytics/view"]);
    assert!(s.queue.is_empty().await.unwrap());
}
