use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use osucad_collab::beatmap;
use osucad_collab::broadcast::BroadcastGroup;
use osucad_collab::codec::{decode_operation, encode_operation, encode_operations};
use osucad_collab::object::ObjectId;
use osucad_collab::op::Operation;
use osucad_collab::presence::UserInfo;
use osucad_collab::protocol::SyncMessage;
use osucad_collab::runtime::{DocumentRuntime, InitialDocument, RuntimeConfig};
use osucad_collab::server::Sequencer;
use osucad_collab::storage::OperationLog;
use osucad_collab::summary::SummaryTree;
use osucad_core::{Beatmap, HitObject, Vec2};
use uuid::Uuid;

fn sample_beatmap(objects: usize) -> Beatmap {
    let mut beatmap = Beatmap::default();
    for i in 0..objects {
        let position = Vec2::new((i * 37 % 512) as f64, (i * 53 % 384) as f64);
        beatmap.hit_objects.push(HitObject::circle(i as f64 * 187.5, position));
    }
    beatmap
}

fn attached(doc: Uuid, summary: &SummaryTree) -> DocumentRuntime {
    let config = RuntimeConfig {
        coalesce_outbound: false,
        ..RuntimeConfig::default()
    };
    let mut runtime = DocumentRuntime::new(doc, Uuid::new_v4(), beatmap::registry(), config);
    runtime.begin_attach().unwrap();
    runtime
        .complete_attach(InitialDocument {
            summary: Some(summary.clone()),
            operations: Vec::new(),
        })
        .unwrap();
    runtime
}

/// A replica of a beatmap with `objects` hit objects, plus `edits` sequenced
/// moves produced by another client.
fn remote_edits(objects: usize, edits: usize) -> (Uuid, SummaryTree, Vec<Operation>) {
    let doc = Uuid::new_v4();
    let summary = beatmap::new_document(doc, &sample_beatmap(objects)).unwrap();
    let mut editor = attached(doc, &summary);
    let ids = beatmap::hit_object_ids(&editor);
    for i in 0..edits {
        let id = &ids[i % ids.len()];
        beatmap::move_hit_object(&mut editor, id, Vec2::new(i as f64, 0.0)).unwrap();
    }
    let mut sequencer = Sequencer::new(0);
    let ops = editor
        .take_outbound()
        .into_iter()
        .filter_map(|m| sequencer.sequence(m))
        .collect();
    (doc, summary, ops)
}

fn bench_operation_encode(c: &mut Criterion) {
    let (_, _, ops) = remote_edits(10, 1);
    let op = &ops[0];
    c.bench_function("operation_encode", |b| {
        b.iter(|| black_box(encode_operation(black_box(op)).unwrap()))
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let (_, _, ops) = remote_edits(10, 1);
    let bytes = encode_operation(&ops[0]).unwrap();
    c.bench_function("operation_decode", |b| {
        b.iter(|| black_box(decode_operation(black_box(&bytes)).unwrap()))
    });
}

fn bench_sequenced_message(c: &mut Criterion) {
    let (doc, _, ops) = remote_edits(100, 100);
    let encoded = encode_operations(&ops).unwrap();
    c.bench_function("sequenced_message_100_ops", |b| {
        b.iter(|| {
            let msg = SyncMessage::sequenced(doc, 100, black_box(&encoded)).unwrap();
            let bytes = msg.encode().unwrap();
            black_box(SyncMessage::decode(&bytes).unwrap());
        })
    });
}

fn bench_apply_remote_ops(c: &mut Criterion) {
    let (doc, summary, ops) = remote_edits(1000, 1000);
    c.bench_function("runtime_apply_1000_remote_moves", |b| {
        b.iter_batched(
            || (attached(doc, &summary), ops.clone()),
            |(mut runtime, ops)| {
                for op in ops {
                    black_box(runtime.process_operation(op).unwrap());
                }
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_local_edits(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let summary = beatmap::new_document(doc, &sample_beatmap(1000)).unwrap();
    c.bench_function("runtime_1000_local_moves", |b| {
        b.iter_batched(
            || {
                let runtime = attached(doc, &summary);
                let ids = beatmap::hit_object_ids(&runtime);
                (runtime, ids)
            },
            |(mut runtime, ids)| {
                for (i, id) in ids.iter().enumerate() {
                    beatmap::move_hit_object(&mut runtime, id, Vec2::new(i as f64, 1.0)).unwrap();
                }
                black_box(runtime.take_outbound());
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_incremental_summary(c: &mut Criterion) {
    let (doc, summary, ops) = remote_edits(1000, 10);
    let mut runtime = attached(doc, &summary);
    runtime.mark_summarized();
    for op in ops {
        runtime.process_operation(op).unwrap();
    }
    c.bench_function("summarize_incremental_1000_objects", |b| {
        b.iter(|| black_box(runtime.summarize_incremental().unwrap()))
    });
    c.bench_function("summarize_full_1000_objects", |b| {
        b.iter(|| black_box(runtime.summarize().unwrap()))
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let doc = Uuid::new_v4();
    let (_, _, ops) = remote_edits(10, 1);
    let msg = SyncMessage::sequenced(doc, 1, &encode_operations(&ops).unwrap()).unwrap();

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);
                let mut receivers = Vec::new();
                for i in 0..100u32 {
                    let user = UserInfo {
                        client_id: Uuid::new_v4(),
                        name: format!("Peer{i}"),
                        color: i,
                    };
                    receivers.push(group.add_peer(user).await);
                }
                black_box(group.broadcast(Uuid::nil(), black_box(&msg), true).unwrap());
            });
        })
    });
}

fn bench_oplog(c: &mut Criterion) {
    let (_, _, ops) = remote_edits(100, 1000);
    c.bench_function("oplog_append_1000_compact", |b| {
        b.iter(|| {
            let mut log = OperationLog::new();
            log.append(black_box(&ops)).unwrap();
            black_box(log.since(900).unwrap());
            black_box(log.compact(500));
        })
    });
}

fn bench_hit_object_lookup(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let summary = beatmap::new_document(doc, &sample_beatmap(1000)).unwrap();
    let runtime = attached(doc, &summary);
    let ids: Vec<ObjectId> = beatmap::hit_object_ids(&runtime);
    c.bench_function("hit_object_position_1000", |b| {
        b.iter(|| {
            for id in &ids {
                black_box(beatmap::hit_object_position(&runtime, id));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_operation_encode,
    bench_operation_decode,
    bench_sequenced_message,
    bench_apply_remote_ops,
    bench_local_edits,
    bench_incremental_summary,
    bench_broadcast,
    bench_oplog,
    bench_hit_object_lookup,
);
criterion_main!(benches);
