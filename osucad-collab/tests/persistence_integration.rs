//! Persistence tests: documents, versions and the op log survive a server
//! restart on RocksDB.

use std::sync::Arc;
use std::time::Duration;

use osucad_collab::beatmap;
use osucad_collab::client::{ClientConfig, SyncClient};
use osucad_collab::object::{MutationPayload, ObjectId};
use osucad_collab::op::{DocumentId, Mutation, Operation};
use osucad_collab::runtime::{DocumentRuntime, InitialDocument, RuntimeConfig};
use osucad_collab::server::{ServerConfig, SyncServer};
use osucad_collab::storage::{Commit, RocksStorage, StorageBackend, StoreConfig};
use osucad_core::{Beatmap, HitObject, Vec2};
use tempfile::TempDir;
use uuid::Uuid;

fn test_beatmap() -> Beatmap {
    let mut beatmap = Beatmap::default();
    beatmap.metadata.title = "Persisted".into();
    beatmap.metadata.creator = "mapper".into();
    let mut circle = HitObject::circle(1000.0, Vec2::new(256.0, 192.0));
    circle.id = "h1".into();
    beatmap.hit_objects.push(circle);
    beatmap
}

fn open_storage(dir: &TempDir) -> Arc<dyn StorageBackend> {
    Arc::new(RocksStorage::open(StoreConfig::for_testing(dir.path())).unwrap())
}

fn server_on(storage: &Arc<dyn StorageBackend>, summary_interval_ops: u64) -> SyncServer {
    let config = ServerConfig {
        summary_interval_ops,
        ..ServerConfig::for_testing()
    };
    SyncServer::with_storage(config, storage.clone(), beatmap::registry())
}

async fn connect(server: &SyncServer, doc: DocumentId) -> SyncClient<osucad_collab::LocalTransport> {
    let mut client = SyncClient::new(server.connect_local(), doc, beatmap::registry(), ClientConfig::named("mapper"));
    client.connect().await.unwrap();
    client
}

async fn wait_for_empty(server: &SyncServer) {
    for _ in 0..200 {
        if server.stats().await.active_rooms == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room was never closed");
}

fn export_commit(commit: &Commit) -> Beatmap {
    let mut runtime = DocumentRuntime::new(commit.document_id, Uuid::nil(), beatmap::registry(), RuntimeConfig::default());
    runtime.begin_attach().unwrap();
    runtime
        .complete_attach(InitialDocument {
            summary: Some(commit.tree.clone()),
            operations: Vec::new(),
        })
        .unwrap();
    beatmap::export(&runtime).unwrap()
}

#[tokio::test]
async fn test_edits_survive_server_restart() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let doc = Uuid::new_v4();

    {
        let server = server_on(&storage, 1000);
        server.import_beatmap(doc, &test_beatmap()).unwrap();
        let mut client = connect(&server, doc).await;
        beatmap::set_metadata(client.runtime_mut(), "title", "Edited").unwrap();
        beatmap::move_hit_object(client.runtime_mut(), &ObjectId::new("h1"), Vec2::new(10.0, 20.0)).unwrap();
        client.settle().await.unwrap();
        client.close().await;
        wait_for_empty(&server).await;
    }

    let restarted = server_on(&storage, 1000);
    let exported = restarted.export_beatmap(doc).await.unwrap();
    assert_eq!(exported.metadata.title, "Edited");
    assert_eq!(exported.metadata.creator, "mapper");
    assert_eq!(exported.hit_objects[0].position, Vec2::new(10.0, 20.0));

    // A new client attaches to the restarted server and sees the edits.
    let client = connect(&restarted, doc).await;
    assert_eq!(client.runtime().last_applied_sequence(), 2);
    assert_eq!(beatmap::export(client.runtime()).unwrap().metadata.title, "Edited");
}

#[tokio::test]
async fn test_op_tail_replayed_without_summary() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let doc = Uuid::new_v4();
    let server = server_on(&storage, 1000);
    server.import_beatmap(doc, &test_beatmap()).unwrap();

    let mut client = connect(&server, doc).await;
    beatmap::set_metadata(client.runtime_mut(), "version", "Insane").unwrap();
    client.settle().await.unwrap();

    // The room is still open, so no version was written yet.
    assert_eq!(storage.list_versions(doc).unwrap().len(), 1);
    assert_eq!(storage.operations_since(doc, 0).unwrap().len(), 1);

    let replica = server.load_document(doc).unwrap();
    assert_eq!(replica.last_applied_sequence(), 1);
    assert_eq!(beatmap::export(&replica).unwrap().metadata.version, "Insane");
    assert_eq!(replica.snapshot(), client.runtime().snapshot());
}

#[tokio::test]
async fn test_summary_interval_writes_versions_and_compacts() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let doc = Uuid::new_v4();
    let server = server_on(&storage, 3);
    server.import_beatmap(doc, &test_beatmap()).unwrap();

    let mut client = connect(&server, doc).await;
    for key in ["title", "artist", "tags"] {
        beatmap::set_metadata(client.runtime_mut(), key, "v2").unwrap();
    }
    client.settle().await.unwrap();

    let versions = storage.list_versions(doc).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].sequence_number, 3);
    assert_eq!(versions[0].parent.as_deref(), Some(versions[1].sha.as_str()));
    assert!(storage.operations_since(doc, 0).unwrap().is_empty());

    // Older versions stay readable.
    let first = storage.get_version(doc, &versions[1].sha).unwrap();
    assert_eq!(export_commit(&first).metadata.title, "Persisted");
    let head = storage.get_latest_version(doc).unwrap().unwrap();
    assert_eq!(export_commit(&head).metadata.title, "v2");

    beatmap::set_metadata(client.runtime_mut(), "source", "after").unwrap();
    client.settle().await.unwrap();
    assert_eq!(storage.operations_since(doc, 3).unwrap().len(), 1);
}

#[tokio::test]
async fn test_last_leave_writes_incremental_version() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let doc = Uuid::new_v4();
    let server = server_on(&storage, 1000);
    server.import_beatmap(doc, &test_beatmap()).unwrap();

    let mut client = connect(&server, doc).await;
    let added = beatmap::add_hit_object(client.runtime_mut(), &HitObject::circle(2000.0, Vec2::new(5.0, 5.0))).unwrap();
    client.settle().await.unwrap();
    let expected = client.runtime().snapshot();
    client.close().await;
    wait_for_empty(&server).await;

    let versions = storage.list_versions(doc).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].sequence_number, 1);
    assert_eq!(server.stats().await.summaries_written, 1);

    // Unchanged objects were stored as handles and resolve to full content.
    let head = storage.get_latest_version(doc).unwrap().unwrap();
    assert!(!head.tree.contains_handles());
    let replica = server.load_document(doc).unwrap();
    assert_eq!(replica.snapshot(), expected);
    assert_eq!(beatmap::hit_object_ids(&replica), vec![ObjectId::new("h1"), added]);
}

#[test]
fn test_rocks_reopen_keeps_documents_and_ops() {
    let dir = TempDir::new().unwrap();
    let doc = Uuid::new_v4();
    let summary = beatmap::new_document(doc, &test_beatmap()).unwrap();

    {
        let storage = RocksStorage::open(StoreConfig::for_testing(dir.path())).unwrap();
        storage.create_document(doc, &summary, 0).unwrap();
        let ops: Vec<Operation> = (1..=3)
            .map(|seq| Operation {
                sequence_number: seq,
                reference_sequence_number: seq - 1,
                mutation: Mutation {
                    target: ObjectId::new(beatmap::METADATA),
                    payload: MutationPayload::MapSet {
                        key: "tags".into(),
                        value: format!("t{seq}").into(),
                    },
                    client_id: Uuid::nil(),
                    local_sequence: seq,
                },
            })
            .collect();
        storage.append_operations(doc, &ops).unwrap();
        storage.sync().unwrap();
    }

    let storage = RocksStorage::open(StoreConfig::for_testing(dir.path())).unwrap();
    let documents = storage.list_documents().unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].id, doc);
    let ops = storage.operations_since(doc, 1).unwrap();
    assert_eq!(ops.iter().map(|o| o.sequence_number).collect::<Vec<_>>(), vec![2, 3]);
    let head = storage.get_latest_version(doc).unwrap().unwrap();
    assert_eq!(head.tree, summary);
}
