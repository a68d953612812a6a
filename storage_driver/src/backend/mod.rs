//! Backend stores the driver dispatches to.
//!
//! Both backends are `object_store` implementations; they differ in how
//! they are opened, how large streamed write chunks are, and whether they
//! can sign download URLs.

mod disk;
mod s3;

use std::sync::Arc;

use bytes::Bytes;
pub use disk::DiskStorage;
use futures::{stream::BoxStream, Stream, StreamExt};
use object_store::{path::Path, ObjectStore, PutMode, PutPayload, WriteMultipart};
pub use s3::S3Storage;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Key reserved for the disk store's lock file. Never returned by
/// [`Backend::walk_keys`] and must not be used by callers.
pub const LOCK_KEY: &str = "store.lock";

/// Maximum number of multipart chunks in flight during a streamed write.
const MAX_CONCURRENT_PARTS: usize = 4;

/// A concrete storage engine.
pub enum Backend {
    Disk(DiskStorage),
    S3(S3Storage),
}

impl Backend {
    /// Whether this backend can hand out presigned download URLs.
    pub fn supports_presigned_urls(&self) -> bool {
        self.as_s3().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Disk(_) => "local",
            Backend::S3(_) => "s3",
        }
    }

    pub(crate) fn as_s3(&self) -> Option<&S3Storage> {
        match self {
            Backend::S3(s3) => Some(s3),
            Backend::Disk(_) => None,
        }
    }

    fn object_store(&self) -> &Arc<dyn ObjectStore> {
        match self {
            Backend::Disk(disk) => disk.object_store(),
            Backend::S3(s3) => s3.object_store(),
        }
    }

    fn write_chunk_size(&self) -> usize {
        match self {
            Backend::Disk(_) => disk::WRITE_CHUNK_SIZE,
            Backend::S3(_) => s3::PUT_CHUNK_SIZE,
        }
    }

    /// Reads the whole value stored at `key`.
    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let path = object_path(key)?;
        let result = self
            .object_store()
            .get(&path)
            .await
            .map_err(|e| Error::from_store(key, e))?;
        result.bytes().await.map_err(|e| Error::from_store(key, e))
    }

    /// Streams the value stored at `key`. Nothing is buffered beyond the
    /// chunks the backend yields.
    pub async fn read_stream(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let path = object_path(key)?;
        let result = self
            .object_store()
            .get(&path)
            .await
            .map_err(|e| Error::from_store(key, e))?;
        let key = key.to_string();
        Ok(Box::pin(
            result
                .into_stream()
                .map(move |chunk| chunk.map_err(|e| Error::from_store(&key, e))),
        ))
    }

    /// Stores `value` at `key`, failing with [`Error::AlreadyExists`] if the
    /// key is taken. The existence check and the write are one conditional
    /// put.
    pub async fn write_bytes(&self, key: &str, value: Bytes) -> Result<usize> {
        let path = object_path(key)?;
        let size = value.len();
        self.object_store()
            .put_opts(&path, PutPayload::from(value), PutMode::Create.into())
            .await
            .map_err(|e| Error::from_store(key, e))?;
        Ok(size)
    }

    /// Stores the chunks of `data` at `key` through a multipart upload.
    ///
    /// The key is checked for existence before the upload starts. A failure
    /// while reading `data` or uploading, or `cancel` firing before the last
    /// chunk is handed over, aborts the upload so no partial object remains.
    pub async fn write_stream<S>(
        &self,
        key: &str,
        mut data: S,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    {
        let path = object_path(key)?;
        let exists = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            exists = self.stat_path(key, &path) => exists?,
        };
        if exists {
            return Err(Error::AlreadyExists {
                key: key.to_string(),
            });
        }

        let upload = self
            .object_store()
            .put_multipart(&path)
            .await
            .map_err(|e| Error::from_store(key, e))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.write_chunk_size());
        let mut size_bytes = 0u64;

        let copied: Result<()> = async {
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    chunk = data.next() => chunk,
                };
                let Some(chunk) = chunk else {
                    return Ok(());
                };
                let chunk = chunk?;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    ready = writer.wait_for_capacity(MAX_CONCURRENT_PARTS) => {
                        ready.map_err(|e| Error::from_store(key, e))?;
                    }
                }
                size_bytes += chunk.len() as u64;
                writer.write(&chunk);
            }
        }
        .await;

        if let Err(err) = copied {
            if let Err(abort_err) = writer.abort().await {
                debug!(key, error = %abort_err, "failed to abort multipart upload");
            }
            return Err(err);
        }

        writer.finish().await.map_err(|e| Error::from_store(key, e))?;
        Ok(size_bytes)
    }

    /// Removes the value at `key`.
    ///
    /// S3 deletes missing objects silently, so existence is checked first to
    /// report [`Error::NotFound`] the same way on every backend.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let path = object_path(key)?;
        if !self.stat_path(key, &path).await? {
            return Err(Error::NotFound {
                key: key.to_string(),
            });
        }
        self.object_store()
            .delete(&path)
            .await
            .map_err(|e| Error::from_store(key, e))
    }

    /// Reports whether a value is stored at `key`.
    pub async fn stat(&self, key: &str) -> Result<bool> {
        let path = object_path(key)?;
        self.stat_path(key, &path).await
    }

    async fn stat_path(&self, key: &str, path: &Path) -> Result<bool> {
        match self.object_store().head(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Error::from_store(key, e)),
        }
    }

    /// Calls `walk` with every stored key except [`LOCK_KEY`], in the order
    /// the backend lists them. The first error returned by `walk` stops the
    /// enumeration and is returned unchanged.
    pub async fn walk_keys<E, F>(&self, mut walk: F) -> Result<(), E>
    where
        F: FnMut(&str) -> Result<(), E>,
        E: From<Error>,
    {
        let mut entries = self.object_store().list(None);
        while let Some(entry) = entries.next().await {
            let entry = entry.map_err(Error::from)?;
            let key = entry.location.as_ref();
            if key == LOCK_KEY {
                continue;
            }
            walk(key)?;
        }
        Ok(())
    }

    /// Releases backend resources such as the disk lock file.
    pub fn close(&self) -> Result<()> {
        match self {
            Backend::Disk(disk) => disk.close(),
            Backend::S3(_) => Ok(()),
        }
    }
}

/// Parses a caller-supplied key into an object path. Keys are used verbatim;
/// anything the path grammar would have to rewrite is rejected.
fn object_path(key: &str) -> Result<Path> {
    if key.is_empty() {
        return Err(Error::InvalidKey {
            key: key.to_string(),
            source: object_store::path::Error::EmptySegment {
                path: key.to_string(),
            },
        });
    }
    Path::parse(key).map_err(|source| Error::InvalidKey {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::testing::{in_memory_s3, FakeSigner};

    fn disk_backend(dir: &tempfile::TempDir) -> Backend {
        Backend::Disk(DiskStorage::open(dir.path()).unwrap())
    }

    fn s3_backend() -> Backend {
        in_memory_s3(FakeSigner::new())
    }

    async fn check_missing_key(backend: &Backend) {
        assert!(!backend.stat("missing/key").await.unwrap());
        let err = backend.read_bytes("missing/key").await.unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", backend.name());
        let err = backend.read_stream("missing/key").await.err().unwrap();
        assert!(err.is_not_found(), "{}: {err}", backend.name());
    }

    async fn check_write_once(backend: &Backend) {
        let written = backend
            .write_bytes("media/one.txt", Bytes::from_static(b"first"))
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert!(backend.stat("media/one.txt").await.unwrap());

        let err = backend
            .write_bytes("media/one.txt", Bytes::from_static(b"second"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists(), "{}: {err}", backend.name());

        let value = backend.read_bytes("media/one.txt").await.unwrap();
        assert_eq!(value.as_ref(), b"first");
    }

    async fn check_remove(backend: &Backend) {
        backend
            .write_bytes("gone.bin", Bytes::from_static(b"x"))
            .await
            .unwrap();
        backend.remove("gone.bin").await.unwrap();
        assert!(!backend.stat("gone.bin").await.unwrap());

        let err = backend.remove("gone.bin").await.unwrap_err();
        assert!(err.is_not_found(), "{}: {err}", backend.name());
    }

    async fn check_stream_round_trip(backend: &Backend) {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"streamed ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let cancel = CancellationToken::new();
        let written = backend
            .write_stream("streams/a.txt", stream::iter(chunks), &cancel)
            .await
            .unwrap();
        assert_eq!(written, 20);

        let mut reader = backend.read_stream("streams/a.txt").await.unwrap();
        let mut data = Vec::new();
        while let Some(chunk) = reader.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(data, b"hello streamed world");

        let err = backend
            .write_stream(
                "streams/a.txt",
                stream::iter(vec![std::io::Result::Ok(Bytes::from_static(b"again"))]),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_already_exists(), "{}: {err}", backend.name());
    }

    async fn check_walk_keys(backend: &Backend) {
        for key in ["a/1", "a/2", "b/3"] {
            backend.write_bytes(key, Bytes::from_static(b"v")).await.unwrap();
        }
        let mut keys = Vec::new();
        backend
            .walk_keys(|key| {
                keys.push(key.to_string());
                Ok::<_, Error>(())
            })
            .await
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a/1", "a/2", "b/3"]);
    }

    async fn run_contract(backend: Backend) {
        check_missing_key(&backend).await;
        check_write_once(&backend).await;
        check_remove(&backend).await;
        check_stream_round_trip(&backend).await;
        backend.close().unwrap();
    }

    #[tokio::test]
    async fn test_disk_contract() {
        let dir = tempfile::tempdir().unwrap();
        run_contract(disk_backend(&dir)).await;
    }

    #[tokio::test]
    async fn test_s3_contract() {
        run_contract(s3_backend()).await;
    }

    #[tokio::test]
    async fn test_disk_walk_keys_hides_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = disk_backend(&dir);
        assert!(dir.path().join(LOCK_KEY).exists());
        check_walk_keys(&backend).await;
    }

    #[tokio::test]
    async fn test_s3_walk_keys_hides_lock_key() {
        let backend = s3_backend();
        backend.write_bytes(LOCK_KEY, Bytes::new()).await.unwrap();
        check_walk_keys(&backend).await;
    }

    #[tokio::test]
    async fn test_walk_keys_stops_on_visitor_error() {
        let backend = s3_backend();
        for key in ["k1", "k2", "k3"] {
            backend.write_bytes(key, Bytes::from_static(b"v")).await.unwrap();
        }

        let mut visited = 0;
        let result = backend
            .walk_keys(|_| {
                visited += 1;
                Err::<(), _>(Error::Config("stop".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::Config(msg)) if msg == "stop"));
        assert_eq!(visited, 1);
    }

    #[tokio::test]
    async fn test_write_stream_aborts_on_reader_error() {
        let backend = s3_backend();
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("reader failed")),
        ];
        let err = backend
            .write_stream("broken.bin", stream::iter(chunks), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!backend.stat("broken.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_stream_cancelled_mid_upload_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = disk_backend(&dir);
        let data = stream::iter(vec![std::io::Result::Ok(Bytes::from(vec![1u8; 64 * 1024]))])
            .chain(stream::pending());

        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                cancel.cancel();
            }
        });

        let err = backend
            .write_stream("media/big.bin", data, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{err}");

        assert!(!backend.stat("media/big.bin").await.unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("media"))
            .map(|entries| entries.map(|e| e.unwrap().file_name()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_write_stream_cancelled_before_start() {
        let backend = s3_backend();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let data = stream::iter(vec![std::io::Result::Ok(Bytes::from_static(b"x"))]);
        let err = backend.write_stream("k", data, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!backend.stat("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_keys() {
        let backend = s3_backend();
        for key in ["", "a//b", "../escape"] {
            let err = backend.stat(key).await.unwrap_err();
            assert!(matches!(err, Error::InvalidKey { .. }), "{key}: {err}");
        }
    }

    #[test]
    fn test_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!disk_backend(&dir).supports_presigned_urls());
        assert!(s3_backend().supports_presigned_urls());
    }
}
