//! Transfer engine integration tests
//!
//! Round trips through scratch files, upload atomicity, read timeouts and
//! scratch cleanup, driven through the filesystem adapter.

mod common;

use cirrus_sftp::{Error, FileLister, FileReader, FileWriter};
use cirrus_store::{MemoryStore, ObjectStore};
use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Write `data` in `chunk`-sized requests, highest offset first
async fn write_reversed(fs: &cirrus_sftp::ObjectFs, path: &str, data: &[u8], chunk: usize) -> u64 {
    let ctx = session();
    let mut transfer = fs.open_write(&ctx, path).await.unwrap();
    if data.is_empty() {
        transfer.write_at(0, &[]).await.unwrap();
    }
    let offsets: Vec<usize> = (0..data.len()).step_by(chunk).collect();
    for &offset in offsets.iter().rev() {
        let end = (offset + chunk).min(data.len());
        transfer.write_at(offset as u64, &data[offset..end]).await.unwrap();
    }
    transfer.close(&ctx).await.unwrap()
}

/// Read a whole file in `chunk`-sized requests until end of file
async fn read_all(fs: &cirrus_sftp::ObjectFs, path: &str, chunk: usize) -> Vec<u8> {
    let ctx = session();
    let mut transfer = fs.open_read(&ctx, path).await.unwrap();
    let mut out = Vec::new();
    loop {
        let data = transfer.read_at(&ctx, out.len() as u64, chunk).await.unwrap();
        if data.is_empty() {
            break;
        }
        out.extend_from_slice(&data);
    }
    transfer.close(&ctx);
    out
}

#[tokio::test]
async fn test_round_trip_sizes() {
    let (tmp, store) = memory_fixture();
    let fs = object_fs(store.clone(), tmp.path(), TIMEOUT);

    for size in [0usize, 1, 11, 32 * 1024, 64 * 1024 + 7, 3 * 1024 * 1024 + 123] {
        let path = format!("/round/{size}.bin");
        let data = payload(size);

        let written = write_reversed(&fs, &path, &data, 32 * 1024).await;
        assert_eq!(written, size as u64);

        let read = read_all(&fs, &path, 32 * 1024).await;
        assert_eq!(read.len(), size, "size {size}");
        assert!(read == data, "content mismatch for size {size}");

        let stat = fs.stat(&session(), &path).await.unwrap();
        assert_eq!(stat.size, size as u64);
    }

    assert!(scratch_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_sparse_and_overlapping_writes() {
    let (tmp, store) = memory_fixture();
    let fs = object_fs(store.clone(), tmp.path(), TIMEOUT);
    let ctx = session();

    let mut transfer = fs.open_write(&ctx, "/sparse.bin").await.unwrap();
    transfer.write_at(10, b"tail").await.unwrap();
    transfer.write_at(0, b"head").await.unwrap();
    transfer.write_at(2, b"XY").await.unwrap();
    assert_eq!(transfer.size(), 14);
    transfer.close(&ctx).await.unwrap();

    let body = read_all(&fs, "/sparse.bin", 4096).await;
    assert_eq!(body, b"heXY\0\0\0\0\0\0tail");
}

#[tokio::test]
async fn test_close_without_writes_creates_nothing() {
    let (tmp, store) = memory_fixture();
    let fs = object_fs(store.clone(), tmp.path(), TIMEOUT);
    let ctx = session();

    let transfer = fs.open_write(&ctx, "/untouched.txt").await.unwrap();
    assert_eq!(transfer.close(&ctx).await.unwrap(), 0);
    assert!(matches!(
        fs.stat(&ctx, "/untouched.txt").await,
        Err(Error::NotFound(_))
    ));
    assert!(store.list_objects(CONTAINER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_interrupted_upload_is_never_visible() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(FailingCopyStore {
        inner: MemoryStore::with_container(CONTAINER),
    });
    let fs = object_fs(Arc::clone(&store), tmp.path(), TIMEOUT);
    let ctx = session();

    let mut transfer = fs.open_write(&ctx, "/report.csv").await.unwrap();
    transfer.write_at(0, &payload(100_000)).await.unwrap();
    let err = transfer.close(&ctx).await.unwrap_err();
    assert!(matches!(err, Error::Backend(_)));

    // Neither the final name nor the temporary object remain
    assert!(store.list_objects(CONTAINER).await.unwrap().is_empty());
    assert!(matches!(
        fs.stat(&ctx, "/report.csv").await,
        Err(Error::NotFound(_))
    ));
    assert!(fs.list(&ctx, "/").await.unwrap().is_empty());
    assert!(scratch_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_stalled_download_times_out() {
    let tmp = tempfile::TempDir::new().unwrap();
    let inner = MemoryStore::with_container(CONTAINER);
    inner
        .upload_from_stream(CONTAINER, "big.bin", Box::pin(std::io::Cursor::new(payload(4096))))
        .await
        .unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(StallingStore::new(inner, 1024));

    let timeout = Duration::from_millis(300);
    let fs = object_fs(store, tmp.path(), timeout);
    let ctx = session();

    let mut transfer = fs.open_read(&ctx, "/big.bin").await.unwrap();
    let mut first = Vec::new();
    while first.len() < 1024 {
        let chunk = transfer.read_at(&ctx, first.len() as u64, 1024 - first.len()).await.unwrap();
        first.extend_from_slice(&chunk);
    }
    assert_eq!(first, payload(4096)[..1024]);

    // Caught up with the stalled producer: no premature EOF, a timeout instead
    let started = Instant::now();
    let err = transfer.read_at(&ctx, 1024, 1024).await.unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    assert!(waited >= timeout);
    assert!(waited < timeout + Duration::from_secs(2));

    let scratch = transfer.scratch_path().unwrap().to_path_buf();
    assert!(scratch.exists());
    transfer.close(&ctx);
    assert!(!scratch.exists());
    assert!(scratch_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_slow_download_is_read_to_the_end() {
    let tmp = tempfile::TempDir::new().unwrap();
    let inner = MemoryStore::with_container(CONTAINER);
    let data = payload(20_000);
    inner
        .upload_from_stream(CONTAINER, "slow.bin", Box::pin(std::io::Cursor::new(data.clone())))
        .await
        .unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(TricklingStore {
        inner,
        piece: 1000,
        pause: Duration::from_millis(20),
    });
    let fs = object_fs(store, tmp.path(), Duration::from_secs(2));

    // Each request asks for more than the producer has delivered so far
    let read = read_all(&fs, "/slow.bin", 4096).await;
    assert_eq!(read.len(), data.len());
    assert_eq!(read, data);
    assert!(scratch_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_object_deleted_after_open_reads_as_missing() {
    let (tmp, store) = memory_fixture();
    store
        .upload_from_stream(CONTAINER, "gone.txt", Box::pin(&b"short-lived"[..]))
        .await
        .unwrap();
    let fs = object_fs(store.clone(), tmp.path(), TIMEOUT);
    let ctx = session();

    let mut transfer = fs.open_read(&ctx, "/gone.txt").await.unwrap();
    store.delete_object(CONTAINER, "gone.txt").await.unwrap();

    let err = transfer.read_at(&ctx, 0, 1024).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
    transfer.close(&ctx);
    assert!(scratch_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_scratch_files_removed_on_every_path() {
    let (tmp, store) = memory_fixture();
    let fs = object_fs(store.clone(), tmp.path(), TIMEOUT);
    let ctx = session();
    assert!(scratch_files(tmp.path()).is_empty());

    // Successful write
    let mut write = fs.open_write(&ctx, "/a.txt").await.unwrap();
    write.write_at(0, b"alpha").await.unwrap();
    assert_eq!(scratch_files(tmp.path()).len(), 1);
    write.close(&ctx).await.unwrap();
    assert!(scratch_files(tmp.path()).is_empty());

    // Partially consumed read
    let mut read = fs.open_read(&ctx, "/a.txt").await.unwrap();
    assert_eq!(read.read_at(&ctx, 0, 2).await.unwrap(), b"al");
    assert_eq!(scratch_files(tmp.path()).len(), 1);
    read.close(&ctx);
    assert!(scratch_files(tmp.path()).is_empty());

    // Write abandoned by a dropped handle (connection teardown)
    let mut abandoned = fs.open_write(&ctx, "/b.txt").await.unwrap();
    abandoned.write_at(0, b"beta").await.unwrap();
    drop(abandoned);
    assert!(scratch_files(tmp.path()).is_empty());
    assert!(fs.stat(&ctx, "/b.txt").await.is_err());

    // Failed upload
    let failing: Arc<dyn ObjectStore> = Arc::new(FailingCopyStore {
        inner: MemoryStore::with_container(CONTAINER),
    });
    let failing_fs = object_fs(failing, tmp.path(), TIMEOUT);
    let mut write = failing_fs.open_write(&ctx, "/c.txt").await.unwrap();
    write.write_at(0, b"gamma").await.unwrap();
    assert!(write.close(&ctx).await.is_err());
    assert!(scratch_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_concurrent_handles_are_independent() {
    let (tmp, store) = memory_fixture();
    let fs = Arc::new(object_fs(store.clone(), tmp.path(), TIMEOUT));

    let mut tasks = Vec::new();
    for i in 0..8usize {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            let path = format!("/parallel/{i}.bin");
            let data = payload(50_000 + i);
            write_reversed(&fs, &path, &data, 8192).await;
            assert_eq!(read_all(&fs, &path, 8192).await, data);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(fs.list(&session(), "/parallel").await.unwrap().len(), 8);
    assert!(scratch_files(tmp.path()).is_empty());
}
