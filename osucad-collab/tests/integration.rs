//! End-to-end collaboration tests.
//!
//! These start a real server and connect real clients, over the
//! in-process transport and over WebSocket, verifying the full sync
//! pipeline.

use osucad_collab::beatmap::{self, hit_object_position, move_hit_object};
use osucad_collab::client::{ClientConfig, ClientEvent, ConnectionState, SyncClient};
use osucad_collab::object::{ObjectId, ObjectSnapshot};
use osucad_collab::op::DocumentId;
use osucad_collab::server::{ServerConfig, SyncServer};
use osucad_collab::transport::{LocalTransport, Transport, WebSocketTransport};
use osucad_core::{Beatmap, HitObject, Vec2};
use uuid::Uuid;

fn test_beatmap() -> Beatmap {
    let mut beatmap = Beatmap::default();
    beatmap.metadata.title = "Integration".into();
    for (i, id) in ["h1", "h2", "h3"].iter().enumerate() {
        let mut circle = HitObject::circle(1000.0 * (i as f64 + 1.0), Vec2::new(100.0 * i as f64, 50.0));
        circle.id = id.to_string();
        beatmap.hit_objects.push(circle);
    }
    beatmap
}

fn start_server() -> (SyncServer, DocumentId) {
    let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
    let doc = Uuid::new_v4();
    server.import_beatmap(doc, &test_beatmap()).unwrap();
    (server, doc)
}

async fn local_client(server: &SyncServer, doc: DocumentId, name: &str) -> SyncClient<LocalTransport> {
    let mut client = SyncClient::new(server.connect_local(), doc, beatmap::registry(), ClientConfig::named(name));
    client.connect().await.unwrap();
    client
}

fn state<T: Transport>(client: &SyncClient<T>) -> Vec<ObjectSnapshot> {
    client.runtime().snapshot()
}

fn position<T: Transport>(client: &SyncClient<T>, id: &str) -> Vec2 {
    hit_object_position(client.runtime(), &ObjectId::new(id)).unwrap()
}

#[tokio::test]
async fn test_client_connects_and_receives_state() {
    let (server, doc) = start_server();
    let mut alice = local_client(&server, doc, "Alice").await;

    assert_eq!(alice.state(), ConnectionState::Connected);
    assert!(matches!(alice.next_event().await.unwrap(), ClientEvent::Connected { .. }));
    let exported = beatmap::export(alice.runtime()).unwrap();
    assert_eq!(exported.metadata.title, "Integration");
    assert_eq!(exported.hit_objects.len(), 3);
}

#[tokio::test]
async fn test_concurrent_moves_last_writer_wins() {
    let (server, doc) = start_server();
    let mut a = local_client(&server, doc, "A").await;
    let mut b = local_client(&server, doc, "B").await;

    // Four unrelated edits first, so the moves land on 5 and 6.
    for key in ["title", "artist", "creator", "version"] {
        beatmap::set_metadata(a.runtime_mut(), key, "x").unwrap();
    }
    a.settle().await.unwrap();
    assert_eq!(a.runtime().last_applied_sequence(), 4);

    move_hit_object(a.runtime_mut(), &ObjectId::new("h1"), Vec2::new(100.0, 200.0)).unwrap();
    a.settle().await.unwrap();
    assert_eq!(a.runtime().last_applied_sequence(), 5);

    // B has not seen anything yet and moves the same object.
    assert_eq!(b.runtime().last_applied_sequence(), 0);
    move_hit_object(b.runtime_mut(), &ObjectId::new("h1"), Vec2::new(150.0, 250.0)).unwrap();
    b.settle().await.unwrap();
    assert_eq!(b.runtime().last_applied_sequence(), 6);

    a.wait_for_sequence(6).await.unwrap();
    assert_eq!(position(&a, "h1"), Vec2::new(150.0, 250.0));
    assert_eq!(position(&b, "h1"), Vec2::new(150.0, 250.0));
    assert_eq!(state(&a), state(&b));

    let exported = server.export_beatmap(doc).await.unwrap();
    let h1 = exported.hit_objects.iter().find(|h| h.id == "h1").unwrap();
    assert_eq!(h1.position, Vec2::new(150.0, 250.0));
}

#[tokio::test]
async fn test_transaction_undo_is_forward_operation() {
    let (server, doc) = start_server();
    let mut a = local_client(&server, doc, "A").await;
    let mut b = local_client(&server, doc, "B").await;
    let ids = ["h1", "h2", "h3"];
    let before: Vec<Vec2> = ids.iter().map(|id| position(&a, id)).collect();

    a.runtime_mut()
        .transact(|rt| {
            for id in ids {
                let id = ObjectId::new(id);
                let p = hit_object_position(rt, &id).unwrap_or(Vec2::ZERO);
                move_hit_object(rt, &id, p + Vec2::new(10.0, 10.0))?;
            }
            Ok(())
        })
        .unwrap();
    a.settle().await.unwrap();
    let moved: Vec<Vec2> = ids.iter().map(|id| position(&a, id)).collect();
    for (m, b) in moved.iter().zip(&before) {
        assert_eq!(*m, *b + Vec2::new(10.0, 10.0));
    }
    let after_move = a.runtime().last_applied_sequence();

    assert!(a.runtime_mut().undo().unwrap());
    a.settle().await.unwrap();
    // Undo went out as three new sequenced operations.
    assert_eq!(a.runtime().last_applied_sequence(), after_move + 3);
    for (id, expected) in ids.iter().zip(&before) {
        assert_eq!(position(&a, id), *expected);
    }

    b.wait_for_sequence(after_move + 3).await.unwrap();
    assert_eq!(state(&a), state(&b));

    assert!(a.runtime_mut().redo().unwrap());
    a.settle().await.unwrap();
    assert_eq!(position(&a, "h2"), moved[1]);
}

#[tokio::test]
async fn test_late_joiner_converges() {
    let (server, doc) = start_server();
    let mut a = local_client(&server, doc, "A").await;

    let circle = HitObject::circle(500.0, Vec2::new(1.0, 2.0));
    let added = beatmap::add_hit_object(a.runtime_mut(), &circle).unwrap();
    beatmap::set_start_time(a.runtime_mut(), &ObjectId::new("h3"), 100.0).unwrap();
    beatmap::remove_hit_object(a.runtime_mut(), &ObjectId::new("h2")).unwrap();
    a.settle().await.unwrap();

    let c = local_client(&server, doc, "C").await;
    assert_eq!(state(&a), state(&c));
    let order = beatmap::hit_object_ids(c.runtime());
    assert_eq!(order, vec![ObjectId::new("h3"), added, ObjectId::new("h1")]);
}

#[tokio::test]
async fn test_rejoin_catches_up_and_resubmits() {
    let (server, doc) = start_server();
    let mut a = local_client(&server, doc, "A").await;
    let mut b = local_client(&server, doc, "B").await;

    a.disconnect().await;
    beatmap::set_metadata(a.runtime_mut(), "title", "from A offline").unwrap();
    beatmap::set_metadata(b.runtime_mut(), "artist", "from B").unwrap();
    b.settle().await.unwrap();

    a.reconnect().await.unwrap();
    a.settle().await.unwrap();
    b.wait_for_sequence(a.runtime().last_applied_sequence()).await.unwrap();

    let exported = beatmap::export(b.runtime()).unwrap();
    assert_eq!(exported.metadata.title, "from A offline");
    assert_eq!(exported.metadata.artist, "from B");
    assert_eq!(state(&a), state(&b));
}

#[tokio::test]
async fn test_peer_left_notification() {
    let (server, doc) = start_server();
    let mut a = local_client(&server, doc, "A").await;
    let b = local_client(&server, doc, "B").await;
    let b_id = b.client_id();
    b.close().await;

    loop {
        match a.next_event().await.unwrap() {
            ClientEvent::PeerLeft(id) => {
                assert_eq!(id, b_id);
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(a.presence().peer_count(), 0);
}

#[tokio::test]
async fn test_websocket_clients_sync() {
    let (server, doc) = start_server();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    let mut a = SyncClient::new(WebSocketTransport::new(&url), doc, beatmap::registry(), ClientConfig::named("A"));
    let mut b = SyncClient::new(WebSocketTransport::new(&url), doc, beatmap::registry(), ClientConfig::named("B"));
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    move_hit_object(a.runtime_mut(), &ObjectId::new("h2"), Vec2::new(42.0, 24.0)).unwrap();
    a.settle().await.unwrap();
    b.wait_for_sequence(1).await.unwrap();
    assert_eq!(position(&b, "h2"), Vec2::new(42.0, 24.0));

    // Stats are updated after the broadcast, so give the session a moment.
    let mut stats = server.stats().await;
    for _ in 0..100 {
        if stats.sequenced_ops == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        stats = server.stats().await;
    }
    assert_eq!(stats.active_rooms, 1);
    assert_eq!(stats.sequenced_ops, 1);
    assert!(stats.total_connections >= 2);
}
