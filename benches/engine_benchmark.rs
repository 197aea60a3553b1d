use coedit::conflict::{detect, rebase};
use coedit::document::{DocumentStore, Position};
use coedit::events::SessionEvent;
use coedit::operation::{LogEntry, OpKind, Operation, OperationLog, LogConfig};
use coedit::version::CompressedContent;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;

fn sample_doc(lines: usize) -> DocumentStore {
    let content = (0..lines)
        .map(|i| format!("let value_{i} = compute({i});"))
        .collect::<Vec<_>>()
        .join("\n");
    DocumentStore::new(Uuid::new_v4(), &content)
}

fn insert_at(line: u32, col: u32, ts: u64) -> Operation {
    Operation::with_timestamp(
        Uuid::new_v4(),
        OpKind::Insert { text: "x".into() },
        Position::new(line, col),
        0,
        ts,
    )
}

fn bench_event_encode(c: &mut Criterion) {
    let event = SessionEvent::OperationApplied {
        project_id: Uuid::new_v4(),
        revision: 42,
        operation: insert_at(10, 4, 1_000),
    };

    c.bench_function("event_encode_applied", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_event_decode(c: &mut Criterion) {
    let event = SessionEvent::OperationApplied {
        project_id: Uuid::new_v4(),
        revision: 42,
        operation: insert_at(10, 4, 1_000),
    };
    let encoded = event.encode().unwrap();

    c.bench_function("event_decode_applied", |b| {
        b.iter(|| {
            black_box(SessionEvent::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_detect_against_unseen(c: &mut Criterion) {
    // 100 unseen operations spread over distinct lines: the common case
    // of a briefly-offline participant catching up.
    let entries: Vec<LogEntry> = (0..100u64)
        .map(|i| LogEntry::new(i + 1, insert_at(i as u32, 0, i)))
        .collect();
    let refs: Vec<&LogEntry> = entries.iter().collect();
    let op = Operation::with_timestamp(
        Uuid::new_v4(),
        OpKind::Delete { length: Some(3) },
        Position::new(50, 10),
        0,
        500,
    );

    c.bench_function("detect_100_unseen", |b| {
        b.iter(|| {
            black_box(detect(black_box(&op), black_box(&refs), 0));
        })
    });
}

fn bench_rebase_chain(c: &mut Criterion) {
    // Worst case: every unseen operation shifts the submission.
    let entries: Vec<LogEntry> = (0..100u64)
        .map(|i| LogEntry::new(i + 1, insert_at(0, 0, i)))
        .collect();
    let refs: Vec<&LogEntry> = entries.iter().collect();
    let op = insert_at(0, 400, 1_000);

    c.bench_function("rebase_over_100_inserts", |b| {
        b.iter(|| {
            black_box(rebase(black_box(&op), black_box(&refs)));
        })
    });
}

fn bench_apply_insert(c: &mut Criterion) {
    let doc = sample_doc(500);

    c.bench_function("apply_insert_500_lines", |b| {
        b.iter(|| {
            let mut doc = doc.clone();
            let rev = doc.apply(black_box(&insert_at(250, 5, 1))).unwrap();
            black_box(rev);
        })
    });
}

fn bench_log_append(c: &mut Criterion) {
    c.bench_function("log_append_1k", |b| {
        b.iter(|| {
            let mut log = OperationLog::new(LogConfig { max_entries: 2_000 });
            for i in 0..1_000u64 {
                log.append(insert_at(0, 0, i));
            }
            black_box(log.head());
        })
    });
}

fn bench_snapshot_compression(c: &mut Criterion) {
    let content = sample_doc(1_000).content();

    c.bench_function("snapshot_compress_1k_lines", |b| {
        b.iter(|| {
            black_box(CompressedContent::compress(black_box(&content)));
        })
    });
}

criterion_group!(
    benches,
    bench_event_encode,
    bench_event_decode,
    bench_detect_against_unseen,
    bench_rebase_chain,
    bench_apply_insert,
    bench_log_append,
    bench_snapshot_compression,
);
criterion_main!(benches);
