//! End-to-end scenarios across the store family.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

use oci_content::manifest::{MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST};
use oci_content::{Descriptor, Digest, ANNOTATION_REF_NAME, ANNOTATION_TITLE};
use oci_store::{
    ContentReader, Fetcher, FileStore, MemoryStore, OciStore, PredecessorLister, ReadOnlyOciStore,
    Storage, StoreError, TagResolver,
};
use tokio::io::AsyncReadExt;

fn reader(content: &[u8]) -> ContentReader {
    Box::new(Cursor::new(content.to_vec()))
}

async fn read_all_from(mut stream: ContentReader) -> Vec<u8> {
    let mut content = Vec::new();
    stream.read_to_end(&mut content).await.unwrap();
    content
}

fn manifest_json(config: &Descriptor, layers: &[&Descriptor]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "config": config,
        "layers": layers,
    }))
    .unwrap()
}

fn index_json(manifests: &[&Descriptor]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "manifests": manifests,
    }))
    .unwrap()
}

/// S1: the memory store round-trips a blob and refuses a second push.
#[tokio::test]
async fn memory_store_round_trip() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let desc = Descriptor::new(
        "test",
        Digest::parse("sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")?,
        11,
    );

    store.push(&desc, reader(b"hello world")).await?;
    assert!(store.exists(&desc).await?);
    assert_eq!(
        b"hello world".to_vec(),
        read_all_from(store.fetch(&desc).await?).await
    );
    assert!(store
        .push(&desc, reader(b"hello world"))
        .await
        .unwrap_err()
        .is_already_exists());
    Ok(())
}

/// S2: an OCI store keeps its tags across a close/reopen cycle, and writes
/// exactly one index entry for a single tagged manifest.
#[tokio::test]
async fn oci_store_tag_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let content = br#"{"layers":[]}"#;
    let desc = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, content);

    {
        let store = OciStore::new(dir.path()).await?;
        store.push(&desc, reader(content)).await?;
        store.tag(&desc, "foobar").await?;
    }

    let raw = std::fs::read(dir.path().join("index.json"))?;
    let index: serde_json::Value = serde_json::from_slice(&raw)?;
    assert_eq!(1, index["manifests"].as_array().unwrap().len());

    let store = OciStore::new(dir.path()).await?;
    let resolved = store.resolve("foobar").await?;
    assert_eq!(desc.digest, resolved.digest);
    assert_eq!(Some("foobar"), resolved.annotation(ANNOTATION_REF_NAME));
    Ok(())
}

/// S3: a directory added to one file store unpacks into another.
#[tokio::test]
async fn file_store_packs_and_unpacks_directories() -> anyhow::Result<()> {
    let scratch = tempfile::tempdir()?;
    std::fs::create_dir_all(scratch.path().join("dir"))?;
    std::fs::write(scratch.path().join("dir/test.txt"), b"hello world")?;

    let source = FileStore::new(scratch.path().join("source"))?;
    let desc = source.add("dir", "", scratch.path().join("dir")).await?;
    let packed = read_all_from(source.fetch(&desc).await?).await;

    let dest_dir = tempfile::tempdir()?;
    let dest = FileStore::new(dest_dir.path())?;
    dest.push(&desc, reader(&packed)).await?;
    assert_eq!(
        b"hello world".to_vec(),
        std::fs::read(dest_dir.path().join("dir/test.txt"))?
    );

    source.close().await?;
    dest.close().await?;
    Ok(())
}

/// S4: path traversal is refused unless explicitly allowed.
#[tokio::test]
async fn file_store_path_traversal_policy() -> anyhow::Result<()> {
    let scratch = tempfile::tempdir()?;
    let work = scratch.path().join("work");
    let mut desc = Descriptor::from_bytes("test", b"escape");
    desc.set_annotation(ANNOTATION_TITLE, "../escape.txt");

    let strict = FileStore::new(&work)?;
    assert!(strict
        .push(&desc, reader(b"escape"))
        .await
        .unwrap_err()
        .is_path_traversal());

    let permissive = FileStore::with_options(
        &work,
        oci_store::FileStoreOptions {
            allow_path_traversal_on_write: true,
            ..Default::default()
        },
    )?;
    permissive.push(&desc, reader(b"escape")).await?;
    assert_eq!(b"escape".to_vec(), std::fs::read(scratch.path().join("escape.txt"))?);
    Ok(())
}

/// S5: the predecessor graph mirrors a layered DAG of manifests and
/// indexes.
#[tokio::test]
async fn predecessor_graph_over_a_dag() -> anyhow::Result<()> {
    let store = MemoryStore::new();

    let mut descs: Vec<Descriptor> = Vec::new();
    let mut contents: Vec<Vec<u8>> = Vec::new();
    let blob = |descs: &mut Vec<Descriptor>, contents: &mut Vec<Vec<u8>>, mt: &str, c: Vec<u8>| {
        descs.push(Descriptor::from_bytes(mt, &c));
        contents.push(c);
    };

    blob(&mut descs, &mut contents, "config", b"config".to_vec()); // 0
    blob(&mut descs, &mut contents, "test", b"foo".to_vec()); // 1
    blob(&mut descs, &mut contents, "test", b"bar".to_vec()); // 2
    blob(&mut descs, &mut contents, "test", b"hello".to_vec()); // 3
    let c = manifest_json(&descs[0], &[&descs[1], &descs[2]]);
    blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_MANIFEST, c); // 4
    let c = manifest_json(&descs[0], &[&descs[3]]);
    blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_MANIFEST, c); // 5
    let c = manifest_json(&descs[0], &[&descs[1], &descs[2], &descs[3]]);
    blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_MANIFEST, c); // 6
    let c = index_json(&[&descs[4], &descs[5]]);
    blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_INDEX, c); // 7
    let c = index_json(&[&descs[6]]);
    blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_INDEX, c); // 8
    let c = index_json(&[]);
    blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_INDEX, c); // 9
    let c = index_json(&[&descs[7], &descs[8], &descs[9]]);
    blob(&mut descs, &mut contents, MEDIA_TYPE_IMAGE_INDEX, c); // 10

    for (desc, content) in descs.iter().zip(contents.iter()) {
        store.push(desc, reader(content)).await?;
    }

    let digests = |descs: Vec<Descriptor>| -> HashSet<String> {
        descs.into_iter().map(|d| d.digest.to_string()).collect()
    };
    assert_eq!(
        digests(vec![descs[10].clone()]),
        digests(store.predecessors(&descs[7]).await?)
    );
    assert_eq!(
        digests(vec![descs[4].clone(), descs[5].clone(), descs[6].clone()]),
        digests(store.predecessors(&descs[0]).await?)
    );
    Ok(())
}

/// S6: 64 concurrent pushes of the same titled blob admit exactly one
/// winner; everyone else learns the name is taken.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_store_concurrent_push_dedup() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileStore::new(dir.path())?);
    let mut desc = Descriptor::from_bytes("test", b"hello world");
    desc.set_annotation(ANNOTATION_TITLE, "test.txt");

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let store = store.clone();
        let desc = desc.clone();
        tasks.push(tokio::spawn(async move {
            store.push(&desc, reader(b"hello world")).await
        }));
    }

    let mut wins = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await? {
            Ok(()) => wins += 1,
            Err(err) if err.is_duplicate_name() => duplicates += 1,
            Err(err) => anyhow::bail!("unexpected error: {err}"),
        }
    }
    assert_eq!(1, wins);
    assert_eq!(63, duplicates);
    assert_eq!(
        b"hello world".to_vec(),
        read_all_from(store.fetch(&desc).await?).await
    );
    Ok(())
}

/// A read-only store over a tar archive of a layout resolves tags and
/// answers predecessor queries like the store that wrote it.
#[tokio::test]
async fn read_only_store_over_a_tar_fixture() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Descriptor::from_bytes("config", b"{}");
    let content = manifest_json(&config, &[]);
    let manifest = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &content);

    {
        let store = OciStore::new(dir.path()).await?;
        store.push(&config, reader(b"{}")).await?;
        store.push(&manifest, reader(&content)).await?;
        store.tag(&manifest, "latest").await?;
    }

    let tar_dir = tempfile::tempdir()?;
    let tar_path = tar_dir.path().join("layout.tar");
    {
        let file = std::fs::File::create(&tar_path)?;
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", dir.path())?;
        builder.finish()?;
    }

    let store = ReadOnlyOciStore::from_tar(&tar_path).await?;
    let resolved = store.resolve("latest").await?;
    assert_eq!(manifest.digest, resolved.digest);

    let fetched = read_all_from(store.fetch(&manifest).await?).await;
    assert_eq!(content, fetched);

    let preds = store.predecessors(&config).await?;
    assert_eq!(1, preds.len());
    assert_eq!(manifest.digest, preds[0].digest);
    Ok(())
}

/// Mismatched content is rejected by every store variant.
#[tokio::test]
async fn corrupt_pushes_are_rejected_everywhere() -> anyhow::Result<()> {
    let desc = Descriptor::from_bytes("test", b"hello world");

    let memory = MemoryStore::new();
    assert!(memory
        .push(&desc, reader(b"hello wOrld"))
        .await
        .unwrap_err()
        .is_mismatched_digest());

    let dir = tempfile::tempdir()?;
    let oci = OciStore::new(dir.path()).await?;
    assert!(oci
        .push(&desc, reader(b"hello wOrld"))
        .await
        .unwrap_err()
        .is_mismatched_digest());

    let dir = tempfile::tempdir()?;
    let file = FileStore::new(dir.path())?;
    let mut named = desc.clone();
    named.set_annotation(ANNOTATION_TITLE, "test.txt");
    assert!(file
        .push(&named, reader(b"hello wOrld"))
        .await
        .unwrap_err()
        .is_mismatched_digest());

    // Short and long streams map to their own kinds.
    let err = memory.push(&desc, reader(b"hello")).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Content(oci_content::ContentError::UnexpectedEof { .. })
    ));
    let err = memory
        .push(&desc, reader(b"hello world with extra"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Content(oci_content::ContentError::TrailingData(_))
    ));
    Ok(())
}

/// Deleting from a deletable OCI store is observed by every later
/// operation.
#[tokio::test]
async fn deletable_oci_store_forgets_content() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = OciStore::new_deletable(dir.path()).await?;
    let content = br#"{"layers":[]}"#;
    let desc = Descriptor::from_bytes(MEDIA_TYPE_IMAGE_MANIFEST, content);

    store.push(&desc, reader(content)).await?;
    store.tag(&desc, "doomed").await?;
    store.delete(&desc).await?;

    assert!(!store.exists(&desc).await?);
    match store.fetch(&desc).await {
        Err(e) => assert!(e.is_not_found()),
        Ok(_) => panic!("expected fetch of deleted content to fail"),
    }
    assert!(store.resolve("doomed").await.unwrap_err().is_not_found());

    // The content can come back after a delete.
    store.push(&desc, reader(content)).await?;
    assert!(store.exists(&desc).await?);
    Ok(())
}
