use std::sync::Arc;

use tempfile::TempDir;

use quire::index::{
    ConcurrentMergeScheduler, LogDocMergePolicy, SerialMergeScheduler, TieredMergePolicy,
};
use quire::storage::file::FileStorageConfig;
use quire::{
    DirectoryReader, Document, Field, IndexWriter, IndexWriterConfig, StandardAnalyzer,
    StorageConfig, StorageFactory, Term,
};

const SOFT_DELETES: &str = "__soft_deletes";

fn config() -> IndexWriterConfig {
    let mut config = IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()));
    config.merge_scheduler = Arc::new(SerialMergeScheduler::new());
    config.merge_policy = Arc::new(LogDocMergePolicy {
        merge_factor: 10,
        ..LogDocMergePolicy::default()
    });
    config
}

fn priced_doc(id: &str, group: &str, price: i64) -> Document {
    Document::builder()
        .add_string("id", id)
        .add_string("group", group)
        .add_text("body", "merge me please")
        .add_numeric_doc_value("price", price)
        .build()
}

/// Global doc id of the live document with `id`.
fn find(reader: &DirectoryReader, id: &str) -> quire::Result<Option<u32>> {
    for doc in 0..reader.max_doc() {
        if reader.is_live(doc) && reader.document(doc)?.get_text("id") == Some(id) {
            return Ok(Some(doc));
        }
    }
    Ok(None)
}

fn price_of(reader: &DirectoryReader, id: &str) -> quire::Result<Option<i64>> {
    let Some(doc) = find(reader, id)? else {
        return Ok(None);
    };
    let (leaf, local) = reader.leaf_for(doc)?;
    Ok(leaf.numeric_doc_value("price", local))
}

#[test]
fn test_force_merge_to_single_segment() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;

    // 2. Five flushed segments of four documents each
    for segment in 0..5 {
        for doc in 0..4 {
            let id = format!("{segment}-{doc}");
            writer.add_document(&priced_doc(&id, &format!("g{segment}"), doc))?;
        }
        writer.flush()?;
    }
    assert_eq!(writer.segment_count(), 5);

    // 3. Delete a whole segment and two single documents
    writer.delete_documents(&[Term::text("group", "g2")])?;
    writer.delete_documents(&[Term::text("id", "0-0"), Term::text("id", "1-1")])?;
    writer.flush()?;
    assert_eq!(writer.segment_count(), 4, "fully deleted segment is dropped");
    let live = writer.num_docs();
    assert_eq!(live, 14);

    // 4. Merge down to one segment
    writer.force_merge(1)?;
    assert_eq!(writer.segment_count(), 1);
    assert_eq!(writer.max_doc(), live);
    writer.commit()?;

    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.leaves().len(), 1);
    assert_eq!(reader.max_doc() as u64, live);
    assert!(!reader.has_deletions());
    assert!(find(&reader, "1-1")?.is_none());
    assert!(find(&reader, "1-2")?.is_some());

    writer.close()?;
    Ok(())
}

#[test]
fn test_doc_values_updates_survive_merge() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let mut config = config();
    config.merge_scheduler = Arc::new(ConcurrentMergeScheduler::with_limits(2, 4));
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;

    // 2. Three segments
    for segment in 0..3 {
        for doc in 0..3 {
            writer.add_document(&priced_doc(&format!("{segment}-{doc}"), "all", 1))?;
        }
        writer.flush()?;
    }

    // 3. Update before and while merging
    writer.update_numeric_doc_value(Term::text("id", "0-1"), "price", 10)?;
    writer.force_merge_with_wait(1, false)?;
    writer.update_numeric_doc_value(Term::text("id", "2-2"), "price", 20)?;
    writer.delete_documents(&[Term::text("id", "1-0")])?;
    writer.wait_for_merges()?;
    writer.commit()?;

    // 4. Everything is visible after the merge
    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.num_docs(), 8);
    assert_eq!(price_of(&reader, "0-1")?, Some(10));
    assert_eq!(price_of(&reader, "2-2")?, Some(20));
    assert_eq!(price_of(&reader, "0-0")?, Some(1));
    assert!(find(&reader, "1-0")?.is_none());

    writer.close()?;
    Ok(())
}

#[test]
fn test_soft_deletes_are_dropped_by_merge() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let mut config = config();
    config.soft_deletes_field = Some(SOFT_DELETES.to_string());
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;

    // 2. Index and soft update
    for id in 0..6 {
        writer.add_document(&priced_doc(&id.to_string(), "all", id))?;
        if id % 2 == 1 {
            writer.flush()?;
        }
    }
    writer.soft_update_document(
        Term::text("id", "1"),
        &priced_doc("1", "all", 100),
        &[Field::numeric_doc_values(SOFT_DELETES, 1)],
    )?;
    writer.commit()?;

    // 3. Readers with the soft deletes field hide the old version
    let with_soft = DirectoryReader::open_with_soft_deletes(
        Arc::clone(&storage),
        Some(SOFT_DELETES),
    )?;
    assert_eq!(with_soft.max_doc(), 7);
    assert_eq!(with_soft.num_docs(), 6);
    assert_eq!(price_of(&with_soft, "1")?, Some(100));

    let plain = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(plain.num_docs(), 7);

    // 4. Merging reclaims the soft deleted document
    writer.force_merge(1)?;
    writer.commit()?;
    let merged = DirectoryReader::open_with_soft_deletes(storage, Some(SOFT_DELETES))?;
    assert_eq!(merged.max_doc(), 6);
    assert_eq!(merged.num_docs(), 6);
    assert_eq!(price_of(&merged, "1")?, Some(100));

    writer.close()?;
    Ok(())
}

#[test]
fn test_force_merge_deletes_reclaims_space() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let mut config = config();
    config.merge_policy = Arc::new(TieredMergePolicy::default());
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;

    // 2. Two segments, half of the first one deleted
    for segment in 0..2 {
        for doc in 0..4 {
            writer.add_document(&priced_doc(&format!("{segment}-{doc}"), "all", doc))?;
        }
        writer.flush()?;
    }
    writer.delete_documents(&[Term::text("id", "0-0"), Term::text("id", "0-1")])?;
    writer.commit()?;
    assert!(DirectoryReader::open(Arc::clone(&storage))?.has_deletions());

    // 3. Merge the deletes away
    writer.force_merge_deletes(true)?;
    writer.commit()?;
    let reader = DirectoryReader::open(storage)?;
    assert!(!reader.has_deletions());
    assert_eq!(reader.num_docs(), 6);

    writer.close()?;
    Ok(())
}

#[test]
fn test_concurrent_merges_keep_every_document() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let mut config = IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()));
    config.max_buffered_docs = Some(5);
    config.merge_scheduler = Arc::new(ConcurrentMergeScheduler::with_limits(2, 4));
    config.merge_policy = Arc::new(LogDocMergePolicy {
        merge_factor: 3,
        ..LogDocMergePolicy::default()
    });
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;

    // 2. Enough documents to cascade merges
    for i in 0..120 {
        writer.add_document(&priced_doc(&i.to_string(), "all", i))?;
    }
    writer.wait_for_merges()?;
    writer.commit()?;

    // 3. Merges reduced the segment count without losing documents
    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.num_docs(), 120);
    assert!(reader.leaves().len() < 24);
    assert_eq!(price_of(&reader, "77")?, Some(77));

    writer.close()?;
    Ok(())
}
