//! End-to-end sessions against an in-memory server

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use trellis_client::{OperationAck, Provider, ProviderCallbacks, ProviderConfig, ProviderStatus};
use trellis_core::{Element, Page};
use trellis_protocol::{MessageType, OperationType};
use trellis_transport::{
    ConnectionState, MockConnector, MockListener, MockServer, RequestError, StaticToken,
};

fn config() -> ProviderConfig {
    let mut config = ProviderConfig::new("ws://mock", "proj", "page-1", "me", "Me");
    config.reconnect_base_ms = 10;
    config.reconnect_jitter_ms = 0;
    config
}

struct Session {
    provider: Provider,
    server: MockServer,
    listener: MockListener,
    connector: MockConnector,
}

/// Start a provider and consume the sync request it sends on open
async fn start(config: ProviderConfig, callbacks: ProviderCallbacks) -> Session {
    let (connector, mut listener) = MockConnector::new();
    let provider = Provider::new(
        config,
        yrs::Doc::new(),
        Arc::new(connector.clone()),
        Arc::new(StaticToken("tok".into())),
        callbacks,
    );
    let mut server = listener.accept().await.unwrap();
    let hello = server.recv_envelope().await.unwrap();
    assert_eq!(hello.kind, MessageType::SyncPage);
    assert!(hello.request_id.is_none());

    Session {
        provider,
        server,
        listener,
        connector,
    }
}

#[tokio::test]
async fn test_connects_and_requests_sync() {
    let s = start(config(), ProviderCallbacks::default()).await;
    assert_eq!(s.connector.urls(), vec!["ws://mock/ws/proj?token=tok".to_string()]);
    assert_eq!(s.provider.connection_state(), ConnectionState::Connected);

    // Late subscribers see the current status immediately
    let status = s.provider.subscribe_status();
    assert_eq!(*status.borrow(), ProviderStatus::Connected);
    assert!(!s.provider.is_synced());
}

#[tokio::test]
async fn test_create_resolves_and_replica_follows_broadcast() {
    let mut s = start(config(), ProviderCallbacks::default()).await;
    let mut changes = s.provider.syncer().subscribe();
    let server = &mut s.server;

    let (ack, _) = tokio::join!(
        s.provider.create_element(Element::new("e1", "text")),
        async {
            let request = server.recv_envelope().await.unwrap();
            assert_eq!(request.kind, MessageType::ElementCreate);
            assert_eq!(request.project_id, "proj");
            assert_eq!(request.page_id, "page-1");
            assert_eq!(request.user_id.as_deref(), Some("me"));
            let request_id = request.request_id.unwrap();
            server.send_json(&json!({
                "type": "element:create",
                "requestId": request_id,
                "payload": {"element": {"id": "e1"}}
            }));
        }
    );

    let ack: OperationAck = ack.unwrap();
    assert_eq!(ack.operation_type, OperationType::Create);
    assert_eq!(ack.element_id, "e1");
    assert!(ack.request_id.starts_with("req-"));

    changes.recv().await.unwrap();
    assert!(s.provider.syncer().find_element("e1").is_some());
    assert_eq!(s.provider.pending_requests(), 0);

    // A repeated broadcast of the same create does not duplicate the node
    server.send_json(&json!({"type": "element:create", "payload": {"element": {"id": "e1"}}}));
    server.send_json(&json!({"type": "element:create", "payload": {"element": {"id": "e2"}}}));
    changes.recv().await.unwrap();
    let ids: Vec<String> = s.provider.syncer().elements().into_iter().map(|e| e.id).collect();
    assert_eq!(ids.iter().filter(|id| id.as_str() == "e1").count(), 1);
    assert!(ids.contains(&"e2".to_string()));
}

#[tokio::test]
async fn test_drop_rejects_in_flight_and_flushes_queue_on_reconnect() {
    let Session {
        provider,
        server,
        mut listener,
        ..
    } = start(config(), ProviderCallbacks::default()).await;

    let (a, b, c, _) = tokio::join!(
        provider.create_element(Element::new("a", "box")),
        provider.update_element(Element::new("b", "box")),
        provider.delete_element("c", vec![]),
        async move {
            let mut server = server;
            for _ in 0..3 {
                server.recv_envelope().await.unwrap();
            }
            server.close(1006, "network lost");
        }
    );

    for result in [a, b, c] {
        assert_eq!(
            result.unwrap_err(),
            RequestError::ConnectionClosed("Connection closed".into())
        );
    }
    assert_eq!(provider.pending_requests(), 0);
    assert_eq!(provider.status(), ProviderStatus::Disconnected);

    // Untracked traffic waits in the offline queue
    assert!(!provider.send_presence(1.0, 1.0, None));
    assert!(!provider.send_presence(2.0, 2.0, Some("a".into())));
    assert_eq!(provider.queued_messages(), 2);

    let mut server = listener.accept().await.unwrap();
    let first = server.recv_envelope().await.unwrap();
    let second = server.recv_envelope().await.unwrap();
    let third = server.recv_envelope().await.unwrap();
    assert_eq!(first.kind, MessageType::Presence);
    assert_eq!(first.payload["cursorX"], json!(1.0));
    assert_eq!(second.kind, MessageType::Presence);
    assert_eq!(second.payload["cursorX"], json!(2.0));
    assert_eq!(third.kind, MessageType::SyncPage);
    assert_eq!(provider.queued_messages(), 0);

    let mut status = provider.subscribe_status();
    status
        .wait_for(|s| *s == ProviderStatus::Connected)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sync_and_structural_broadcasts() {
    let s = start(config(), ProviderCallbacks::default()).await;
    let mut synced = s.provider.subscribe_synced();

    s.server.send_json(&json!({
        "type": "sync:page",
        "payload": {
            "elements": [
                {"id": "root", "type": "section", "elements": [
                    {"id": "child", "parentId": "root", "order": 0},
                    {"id": "grandchild-holder", "parentId": "root", "order": 1, "elements": [
                        {"id": "gc", "parentId": "grandchild-holder"}
                    ]}
                ]},
                {"id": "loose", "order": 1}
            ],
            "pages": [{"Id": "p1", "title": "Home"}],
            "users": [
                {"userName": "Ghost", "cursorX": 1},
                {"userId": "u2", "userName": "Bo", "cursorX": 3, "cursorY": 4}
            ]
        }
    }));
    synced.recv().await.unwrap();
    assert!(s.provider.is_synced());
    assert_eq!(s.provider.syncer().elements().len(), 2);
    assert_eq!(s.provider.syncer().pages(), vec![Page::new("p1").with_field("title", "Home")]);
    assert_eq!(s.provider.awareness().remote_count(), 1);

    let mut changes = s.provider.syncer().subscribe();

    // Move into a parent that does not exist lands at the root
    s.server.send_json(&json!({
        "type": "element:move",
        "payload": {"elementId": "child", "newParentId": "ghost", "newOrder": 0}
    }));
    changes.recv().await.unwrap();
    let roots: Vec<String> = s.provider.syncer().elements().into_iter().map(|e| e.id).collect();
    assert_eq!(roots[0], "child");
    assert_eq!(s.provider.syncer().find_element("child").unwrap().parent_id, None);

    // Delete cascades over server-listed descendants
    s.server.send_json(&json!({
        "type": "element:delete",
        "payload": {"elementId": "grandchild-holder", "deletedChildren": ["gc"]}
    }));
    changes.recv().await.unwrap();
    assert!(s.provider.syncer().find_element("grandchild-holder").is_none());
    assert!(s.provider.syncer().find_element("gc").is_none());
    assert!(s.provider.syncer().find_element("root").is_some());

    // Page broadcasts
    s.server.send_json(&json!({"type": "page:create", "payload": {"page": {"Id": "p2"}}}));
    changes.recv().await.unwrap();
    s.server.send_json(&json!({"type": "page:delete", "payload": {"pageId": "p1"}}));
    changes.recv().await.unwrap();
    let pages: Vec<String> = s.provider.syncer().pages().into_iter().map(|p| p.id).collect();
    assert_eq!(pages, vec!["p2".to_string()]);
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let s = start(config(), ProviderCallbacks::default()).await;
    let mut synced = s.provider.subscribe_synced();

    s.server.send("{not json");
    s.server.send(r#"{"type":"element:create","payload":{"wrong":true}}"#);
    s.server.send_json(&json!({"type": "sync:page", "payload": {"elements": [{"id": "a"}]}}));

    synced.recv().await.unwrap();
    assert_eq!(s.provider.connection_state(), ConnectionState::Connected);
    assert!(s.provider.syncer().elements().is_empty());
    assert!(!s.provider.is_synced());
}

#[tokio::test]
async fn test_server_errors() {
    let (tx, mut errors) = mpsc::unbounded_channel::<String>();
    let callbacks = ProviderCallbacks::default().on_error(move |message| {
        let _ = tx.send(message.to_string());
    });
    let mut s = start(config(), callbacks).await;
    let server = &mut s.server;

    // Correlated error rejects only its caller
    let (result, _) = tokio::join!(s.provider.move_element("e1", None, 2), async {
        let request = server.recv_envelope().await.unwrap();
        assert_eq!(request.kind, MessageType::ElementMove);
        assert_eq!(request.payload["newOrder"], json!(2));
        server.send_json(&json!({
            "type": "error",
            "requestId": request.request_id.unwrap(),
            "error": "Element locked",
            "payload": {"code": "LOCKED"}
        }));
    });
    assert_eq!(result.unwrap_err(), RequestError::Rejected("Element locked".into()));
    assert!(errors.try_recv().is_err());

    // Uncorrelated error goes to the callback
    server.send_json(&json!({"type": "error", "message": "Quota exceeded", "payload": {}}));
    assert_eq!(errors.recv().await.as_deref(), Some("Quota exceeded"));
}

#[tokio::test]
async fn test_error_reply_without_payload_rejects() {
    let mut cfg = config();
    cfg.request_timeout_ms = 60_000;
    let mut s = start(cfg, ProviderCallbacks::default()).await;
    let server = &mut s.server;

    let (result, _) = tokio::join!(s.provider.move_element("e1", None, 0), async {
        let request = server.recv_envelope().await.unwrap();
        server.send_json(&json!({
            "type": "error",
            "requestId": request.request_id.unwrap(),
            "message": "Element locked"
        }));
    });
    assert_eq!(result.unwrap_err(), RequestError::Rejected("Element locked".into()));
    assert_eq!(s.provider.pending_requests(), 0);
}

#[tokio::test]
async fn test_success_false_reply_rejects() {
    let mut s = start(config(), ProviderCallbacks::default()).await;
    let server = &mut s.server;

    let (result, _) = tokio::join!(s.provider.delete_element("e9", vec!["e10".into()]), async {
        let request = server.recv_envelope().await.unwrap();
        assert_eq!(request.payload["deletedChildren"], json!(["e10"]));
        server.send_json(&json!({
            "type": "element:delete",
            "requestId": request.request_id.unwrap(),
            "payload": {"success": false, "message": "Not found"}
        }));
    });
    assert_eq!(result.unwrap_err(), RequestError::Rejected("Not found".into()));
}

#[tokio::test]
async fn test_remote_presence_and_leave() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let callbacks = ProviderCallbacks::default().on_presence(move |update| {
        assert_eq!(update.user_id, "u2");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let s = start(config(), callbacks).await;
    let mut presence = s.provider.on_presence_change();
    assert!(presence.recv().await.unwrap().is_empty());

    // Our own echo is ignored
    s.server.send_json(&json!({
        "type": "presence", "userId": "me",
        "payload": {"userName": "Me", "cursorX": 9, "cursorY": 9}
    }));
    s.server.send_json(&json!({
        "type": "presence", "userId": "u2",
        "payload": {"userName": "Bo", "cursorX": 5, "cursorY": 6, "elementId": "e1"}
    }));

    let snapshot = presence.recv().await.unwrap();
    assert_eq!(snapshot.users.len(), 1);
    assert_eq!(snapshot.users["u2"].user_name, "Bo");
    assert_eq!(snapshot.remote_users["u2"].x, 5.0);
    assert_eq!(snapshot.selected_by_user["u2"].as_deref(), Some("e1"));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    s.server.send_json(&json!({"type": "user:leave", "payload": {"userId": "u2"}}));
    assert!(presence.recv().await.unwrap().is_empty());
    assert_eq!(s.provider.awareness().remote_count(), 0);
}

#[tokio::test]
async fn test_send_presence_is_untracked() {
    let mut s = start(config(), ProviderCallbacks::default()).await;

    assert!(s.provider.send_presence(3.0, 4.0, Some("e1".into())));
    let envelope = s.server.recv_envelope().await.unwrap();
    assert_eq!(envelope.kind, MessageType::Presence);
    assert!(envelope.request_id.is_none());
    assert_eq!(envelope.payload["userId"], "me");
    assert_eq!(envelope.payload["elementId"], "e1");

    let cursor = s.provider.awareness().local_cursor();
    assert_eq!((cursor.x, cursor.y), (3.0, 4.0));
    assert_eq!(s.provider.awareness().local_selection().as_deref(), Some("e1"));
    assert_eq!(s.provider.pending_requests(), 0);
}

#[tokio::test]
async fn test_rate_limit_applies_to_requests_not_presence() {
    let mut cfg = config();
    cfg.requests_per_second = 1;
    cfg.burst_size = 1;
    let mut s = start(cfg, ProviderCallbacks::default()).await;
    let server = &mut s.server;

    let (first, _) = tokio::join!(s.provider.create_element(Element::new("a", "box")), async {
        let request = server.recv_envelope().await.unwrap();
        server.send_json(&json!({
            "type": "element:create",
            "requestId": request.request_id.unwrap(),
            "payload": {"element": {"id": "a"}}
        }));
    });
    assert!(first.is_ok());

    let second = s.provider.create_element(Element::new("b", "box")).await;
    assert_eq!(second.unwrap_err(), RequestError::RateLimited);
    assert_eq!(s.provider.queued_messages(), 0);

    assert!(s.provider.send_presence(1.0, 1.0, None));
    let presence = server.recv_envelope().await.unwrap();
    assert_eq!(presence.kind, MessageType::Presence);
}

#[tokio::test]
async fn test_rate_limited_presence_when_enabled() {
    let mut cfg = config();
    cfg.requests_per_second = 1;
    cfg.burst_size = 1;
    cfg.rate_limit_presence = true;
    let mut s = start(cfg, ProviderCallbacks::default()).await;

    assert!(s.provider.send_presence(1.0, 1.0, None));
    assert!(!s.provider.send_presence(2.0, 2.0, None));

    let frames = s.server.drain();
    assert_eq!(frames.len(), 1);
    // Local awareness still moved
    assert_eq!(s.provider.awareness().local_cursor().x, 2.0);
}

#[tokio::test]
async fn test_request_timeout() {
    let mut cfg = config();
    cfg.request_timeout_ms = 50;
    let s = start(cfg, ProviderCallbacks::default()).await;

    let err = s
        .provider
        .update_element(Element::new("slow", "box"))
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Timeout { timeout_ms: 50, .. }));
    assert_eq!(s.provider.pending_requests(), 0);
}

#[tokio::test]
async fn test_page_mutations_are_unsupported() {
    let s = start(config(), ProviderCallbacks::default()).await;
    assert!(matches!(
        s.provider.create_page(Page::new("p9")).await,
        Err(RequestError::Unsupported(_))
    ));
    assert!(matches!(
        s.provider.update_page(Page::new("p9")).await,
        Err(RequestError::Unsupported(_))
    ));
    assert!(matches!(
        s.provider.delete_page("p9").await,
        Err(RequestError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_manual_sync_request() {
    let mut s = start(config(), ProviderCallbacks::default()).await;
    assert!(s.provider.request_sync());
    let envelope = s.server.recv_envelope().await.unwrap();
    assert_eq!(envelope.kind, MessageType::SyncPage);
    assert_eq!(envelope.payload, json!({}));
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_final() {
    let mut s = start(config(), ProviderCallbacks::default()).await;
    let provider = &s.provider;
    let server = &mut s.server;

    let (result, _) = tokio::join!(provider.create_element(Element::new("x", "box")), async {
        server.recv_envelope().await.unwrap();
        provider.destroy();
    });
    assert_eq!(
        result.unwrap_err(),
        RequestError::ConnectionClosed("Provider destroyed".into())
    );

    assert!(provider.is_destroyed());
    assert_eq!(provider.status(), ProviderStatus::Disconnected);
    assert_eq!(provider.connection_state(), ConnectionState::Disconnected);
    assert_eq!(server.recv().await, None);

    provider.destroy();
    assert!(!provider.send_presence(0.0, 0.0, None));
    assert!(matches!(
        provider.create_element(Element::new("y", "box")).await,
        Err(RequestError::ConnectionClosed(_))
    ));

    // No reconnect after teardown
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(s.listener.try_accept().is_none());
    assert_eq!(s.connector.attempts(), 1);
}
