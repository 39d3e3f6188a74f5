use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use quire::index::merge_scheduler::SerialMergeScheduler;
use quire::storage::memory::MemoryStorageConfig;
use quire::storage::{StorageConfig, StorageFactory};
use quire::{Document, IndexWriter, IndexWriterConfig, StandardAnalyzer, Term};
use rand::Rng;

const WORDS: &[&str] = &[
    "segment", "merge", "commit", "flush", "delete", "update", "reader", "writer", "posting",
    "term", "field", "index", "search", "query", "buffer", "thread", "stall", "policy",
];

fn random_body(words: usize) -> String {
    let mut rng = rand::rng();
    (0..words)
        .map(|_| WORDS[rng.random_range(0..WORDS.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

fn generate_docs(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            Document::builder()
                .add_string("id", &format!("doc_{i}"))
                .add_text("body", &random_body(32))
                .add_numeric_doc_value("rank", i as i64)
                .build()
        })
        .collect()
}

fn new_writer() -> IndexWriter {
    let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))
        .unwrap();
    let mut config = IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()));
    config.merge_scheduler = Arc::new(SerialMergeScheduler::new());
    IndexWriter::new(storage, config).unwrap()
}

fn bench_add_documents(c: &mut Criterion) {
    let mut group = c.benchmark_group("Add Documents");
    group.sample_size(10);

    for count in [1_000usize, 5_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let docs = generate_docs(count);
            b.iter(|| {
                let writer = new_writer();
                for doc in &docs {
                    writer.add_document(doc).unwrap();
                }
                writer.commit().unwrap();
                writer.close().unwrap();
            })
        });
    }
    group.finish();
}

fn bench_update_documents(c: &mut Criterion) {
    let mut group = c.benchmark_group("Update Documents");
    group.sample_size(10);
    let count = 2_000;
    let docs = generate_docs(count);

    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("update_by_id", |b| {
        b.iter(|| {
            let writer = new_writer();
            for doc in &docs {
                writer.add_document(doc).unwrap();
            }
            writer.commit().unwrap();
            for (i, doc) in docs.iter().enumerate() {
                writer
                    .update_document(Term::text("id", &format!("doc_{i}")), doc)
                    .unwrap();
            }
            writer.commit().unwrap();
            writer.close().unwrap();
        })
    });
    group.finish();
}

fn bench_force_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("Force Merge");
    group.sample_size(10);
    let docs = generate_docs(4_000);

    group.bench_function("force_merge_1", |b| {
        b.iter(|| {
            let writer = new_writer();
            for chunk in docs.chunks(500) {
                writer.add_documents(chunk).unwrap();
                writer.flush().unwrap();
            }
            writer.force_merge(1).unwrap();
            assert_eq!(writer.segment_count(), 1);
            writer.close().unwrap();
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_add_documents,
    bench_update_documents,
    bench_force_merge
);
criterion_main!(benches);
