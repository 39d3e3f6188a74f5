use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use quire::index::{
    KeepOnlyLastCommitDeletionPolicy, NoDeletionPolicy, SerialMergeScheduler,
    SnapshotDeletionPolicy, list_commits,
};
use quire::storage::file::FileStorageConfig;
use quire::{
    CheckIndex, DirectoryReader, Document, IndexWriter, IndexWriterConfig, OpenMode,
    QuireError, StandardAnalyzer, Storage, StorageConfig, StorageFactory, Term,
};

fn config() -> IndexWriterConfig {
    let mut config = IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()));
    config.merge_scheduler = Arc::new(SerialMergeScheduler::new());
    config
}

fn id_doc(id: &str) -> Document {
    Document::builder()
        .add_string("id", id)
        .add_text("body", "commit point content")
        .build()
}

fn segments_files(storage: &dyn Storage) -> quire::Result<Vec<String>> {
    let mut files: Vec<String> = storage
        .list_files()?
        .into_iter()
        .filter(|f| f.starts_with("segments_"))
        .collect();
    files.sort();
    Ok(files)
}

#[test]
fn test_keep_only_last_commit() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let mut config = config();
    config.deletion_policy = Arc::new(KeepOnlyLastCommitDeletionPolicy);
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;

    // 2. Three commits
    for id in ["1", "2", "3"] {
        writer.add_document(&id_doc(id))?;
        writer.commit()?;
    }

    // 3. Only the newest segments file and its files remain
    assert_eq!(segments_files(storage.as_ref())?, vec!["segments_3".to_string()]);
    let commits = list_commits(storage.as_ref())?;
    assert_eq!(commits.len(), 1);
    let referenced = commits[0].files();
    for file in storage.list_files()? {
        if file.starts_with('_') {
            assert!(referenced.contains(&file), "unreferenced file {file}");
        }
    }

    writer.close()?;
    Ok(())
}

#[test]
fn test_open_writer_on_older_commit() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let mut config = config();
    config.deletion_policy = Arc::new(NoDeletionPolicy);
    let writer = IndexWriter::new(Arc::clone(&storage), config.clone())?;

    // 2. Three commits, all kept
    for id in ["1", "2", "3"] {
        writer.add_document(&id_doc(id))?;
        writer.commit()?;
    }
    writer.close()?;
    let commits = list_commits(storage.as_ref())?;
    assert_eq!(
        commits.iter().map(|c| c.generation()).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // 3. Reading an old commit
    let first = DirectoryReader::open_commit(Arc::clone(&storage), &commits[0], None)?;
    assert_eq!(first.num_docs(), 1);

    // 4. A writer on the first commit continues after the newest generation
    config.index_commit = Some(commits[0].clone());
    let writer = IndexWriter::new(Arc::clone(&storage), config.clone())?;
    assert_eq!(writer.num_docs(), 1);
    writer.add_document(&id_doc("4"))?;
    writer.commit()?;
    writer.close()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.generation(), 4);
    assert_eq!(reader.num_docs(), 2);

    // 5. Create mode cannot start from a commit
    config.open_mode = OpenMode::Create;
    assert!(matches!(
        IndexWriter::new(storage, config),
        Err(QuireError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn test_create_mode_replaces_index() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    writer.add_document(&id_doc("old"))?;
    writer.close()?;

    // 2. Append mode sees the old document
    let mut config = config();
    config.open_mode = OpenMode::Append;
    let writer = IndexWriter::new(Arc::clone(&storage), config.clone())?;
    assert_eq!(writer.num_docs(), 1);
    writer.close()?;

    // 3. Create mode starts empty and commits a newer generation
    config.open_mode = OpenMode::Create;
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;
    assert_eq!(writer.num_docs(), 0);
    assert!(writer.commit()? > 0);
    writer.close()?;

    let reader = DirectoryReader::open(storage)?;
    assert_eq!(reader.num_docs(), 0);
    assert_eq!(reader.generation(), 2);
    Ok(())
}

#[test]
fn test_append_without_index_fails() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;

    // 2. Nothing to append to
    let mut config = config();
    config.open_mode = OpenMode::Append;
    assert!(matches!(
        IndexWriter::new(Arc::clone(&storage), config),
        Err(QuireError::IndexNotFound(_))
    ));

    // 3. Create-or-append writes segments_1 on the first commit
    let writer = IndexWriter::new(Arc::clone(&storage), self::config())?;
    assert!(writer.commit()? >= 0);
    assert_eq!(segments_files(storage.as_ref())?, vec!["segments_1".to_string()]);
    writer.close()?;
    Ok(())
}

#[test]
fn test_snapshot_protects_commit() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let policy = Arc::new(SnapshotDeletionPolicy::new(Arc::new(
        KeepOnlyLastCommitDeletionPolicy,
    )));
    let mut config = config();
    config.deletion_policy = policy.clone();
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;

    // 2. Snapshot the first commit
    writer.add_document(&id_doc("1"))?;
    writer.commit()?;
    let snapshot = policy.snapshot()?;
    assert_eq!(snapshot.generation(), 1);

    writer.add_document(&id_doc("2"))?;
    writer.delete_documents(&[Term::text("id", "1")])?;
    writer.commit()?;
    assert_eq!(
        segments_files(storage.as_ref())?,
        vec!["segments_1".to_string(), "segments_2".to_string()]
    );

    // 3. The snapshot is still readable
    let old = DirectoryReader::open_commit(Arc::clone(&storage), &snapshot, None)?;
    assert_eq!(old.num_docs(), 1);
    assert_eq!(old.document(0)?.get_text("id"), Some("1"));

    // 4. Releasing lets the policy drop it
    policy.release(&snapshot)?;
    writer.delete_unused_files()?;
    assert_eq!(segments_files(storage.as_ref())?, vec!["segments_2".to_string()]);
    assert!(policy.release(&snapshot).is_err());

    writer.close()?;
    Ok(())
}

#[test]
fn test_commit_user_data() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;

    // 2. User data alone is a change worth committing
    writer.add_document(&id_doc("1"))?;
    writer.commit()?;
    let data = BTreeMap::from([("checkpoint".to_string(), "42".to_string())]);
    writer.set_live_commit_data(data.clone())?;
    assert!(writer.commit()? > 0);
    writer.close()?;

    // 3. It travels with the commit
    let commits = list_commits(storage.as_ref())?;
    assert_eq!(commits.last().map(|c| c.user_data()), Some(&data));
    let writer = IndexWriter::new(storage, config())?;
    assert_eq!(writer.live_commit_data(), data);
    writer.close()?;
    Ok(())
}

#[test]
fn test_corrupt_commit_is_detected() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let writer = IndexWriter::new(Arc::clone(&storage), config())?;
    for id in ["1", "2"] {
        writer.add_document(&id_doc(id))?;
    }
    writer.close()?;
    assert!(CheckIndex::check(storage.as_ref())?.is_clean());

    // 2. Flip a byte in the middle of segments_1
    let path = temp_dir.path().join("segments_1");
    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x5A;
    fs::write(&path, &bytes).unwrap();

    // 3. Readers and writers refuse the commit
    assert!(matches!(
        DirectoryReader::open(Arc::clone(&storage)),
        Err(QuireError::CorruptIndex(_))
    ));
    assert!(matches!(
        IndexWriter::new(Arc::clone(&storage), config()),
        Err(QuireError::CorruptIndex(_))
    ));
    assert!(matches!(
        CheckIndex::check(storage.as_ref()),
        Err(QuireError::CorruptIndex(_))
    ));
    Ok(())
}

#[test]
fn test_check_index_reports_json() -> quire::Result<()> {
    // 1. Setup Storage
    let temp_dir = TempDir::new().unwrap();
    let storage =
        StorageFactory::create(StorageConfig::File(FileStorageConfig::new(temp_dir.path())))?;
    let mut config = config();
    config.use_compound_file = false;
    let writer = IndexWriter::new(Arc::clone(&storage), config)?;
    for id in 0..10 {
        writer.add_document(&id_doc(&id.to_string()))?;
    }
    writer.delete_documents(&[Term::text("id", "3")])?;
    writer.close()?;

    // 2. Check the commit
    let status = CheckIndex::check(storage.as_ref())?;
    assert!(status.is_clean());
    assert_eq!(status.total_docs, 9);
    assert_eq!(status.segments_file.as_deref(), Some("segments_1"));

    let json: serde_json::Value = serde_json::from_str(&status.to_json_string()?)?;
    assert_eq!(json["total_docs"], 9);
    assert_eq!(json["segments"][0]["del_count"], 1);
    Ok(())
}
