use std::sync::Arc;

use super::*;
use crate::testing::TestPusher;

async fn test_server() -> Arc<Server> {
    let server = Server::new(Arc::new(Config::default()))
        .await
        .expect("server");
    server.spawn_registry().await;
    server
}

#[tokio::test]
async fn add_and_lookup_pusher() {
    let server = test_server().await;
    let pusher = TestPusher::new("p1", "/live/cam1");

    assert!(server.add_pusher(pusher, false).await);
    assert_eq!(server.pusher_count(), 1);

    let found = server.get_pusher("/live/cam1", None).await.expect("pusher");
    assert_eq!(found.id(), "p1");
    assert!(server.get_pusher("/live/other", None).await.is_none());
}

#[tokio::test]
async fn occupied_path_rejected_without_close_old() {
    let server = test_server().await;
    let first = TestPusher::new("p1", "/live/cam1");
    let second = TestPusher::new("p2", "/live/cam1");

    assert!(server.add_pusher(first, false).await);
    assert!(!server.add_pusher(second, false).await);

    // Registry unchanged: still the first pusher.
    assert_eq!(server.pusher_count(), 1);
    let found = server.get_pusher("/live/cam1", None).await.expect("pusher");
    assert_eq!(found.id(), "p1");
}

#[tokio::test]
async fn close_old_replaces_and_stops_previous() {
    let server = test_server().await;
    let first = TestPusher::new("p1", "/live/cam1");
    let second = TestPusher::new("p2", "/live/cam1");

    assert!(server.add_pusher(Arc::clone(&first) as Arc<dyn Pusher>, false).await);
    assert!(server.add_pusher(second, true).await);

    assert_eq!(server.pusher_count(), 1);
    let found = server.get_pusher("/live/cam1", None).await.expect("pusher");
    assert_eq!(found.id(), "p2");

    // The old pusher is stopped asynchronously.
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        while !first.is_stopped() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("old pusher stopped");
}

#[tokio::test]
async fn remove_is_by_id() {
    let server = test_server().await;
    let pusher = TestPusher::new("p1", "/live/cam1");
    assert!(server.add_pusher(pusher, false).await);

    assert!(!server.remove_pusher("unknown-id").await);
    assert_eq!(server.pusher_count(), 1);

    assert!(server.remove_pusher("p1").await);
    assert_eq!(server.pusher_count(), 0);
}

#[tokio::test]
async fn get_pusher_hook_can_substitute() {
    let server = test_server().await;
    let hook: GetPusherHook = Arc::new(|_server, _session, path, pusher| {
        Box::pin(async move {
            if path == "/synthetic" {
                Some(TestPusher::new("hooked", "/synthetic") as Arc<dyn Pusher>)
            } else {
                pusher
            }
        })
    });
    server.register_get_pusher_hook(hook);

    let found = server.get_pusher("/synthetic", None).await.expect("hooked");
    assert_eq!(found.id(), "hooked");
    assert!(server.get_pusher("/other", None).await.is_none());
}
