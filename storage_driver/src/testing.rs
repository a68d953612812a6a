//! Fixtures shared by the unit tests.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use object_store::{
    memory::InMemory,
    path::Path,
    GetOptions,
    GetResult,
    ListResult,
    MultipartUpload,
    ObjectMeta,
    ObjectStore,
    PutMultipartOpts,
    PutOptions,
    PutPayload,
    PutResult,
};
use url::Url;

use crate::{backend::S3Storage, signer::UrlSigner, Backend};

pub const TEST_BUCKET: &str = "bucket";

/// Signer producing deterministic `https://cdn.example.com` URLs.
pub struct FakeSigner {
    calls: AtomicUsize,
    fail: bool,
    delay: Duration,
}

impl FakeSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            delay: Duration::ZERO,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
            delay: Duration::ZERO,
        })
    }

    /// A signer that takes `delay` per request, to widen race windows.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UrlSigner for FakeSigner {
    async fn presigned_get_object(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_content_type: Option<&str>,
    ) -> Result<Url> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(anyhow!("signature generation failed"));
        }
        let mut url = Url::parse(&format!("https://cdn.example.com/{bucket}/{key}"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("X-Sig", &format!("sig-{call}"));
            query.append_pair("X-Expires", &ttl.as_secs().to_string());
            if let Some(content_type) = response_content_type {
                query.append_pair("response-content-type", content_type);
            }
        }
        Ok(url)
    }
}

/// S3 backend over an in-memory object store.
pub fn in_memory_s3(signer: Arc<FakeSigner>) -> Backend {
    Backend::S3(S3Storage::new(
        Arc::new(InMemory::new()),
        signer,
        TEST_BUCKET,
    ))
}

/// In-memory store whose writes or deletes can be made to fail.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: InMemory,
    fail_put: bool,
    fail_delete: bool,
}

impl FaultyStore {
    pub fn failing_put() -> Self {
        Self {
            fail_put: true,
            ..Default::default()
        }
    }

    pub fn failing_delete() -> Self {
        Self {
            fail_delete: true,
            ..Default::default()
        }
    }

    fn refused(op: &str) -> object_store::Error {
        object_store::Error::Generic {
            store: "FaultyStore",
            source: format!("{op} refused").into(),
        }
    }
}

impl fmt::Display for FaultyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FaultyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        if self.fail_put {
            return Err(Self::refused("put"));
        }
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        if self.fail_put {
            return Err(Self::refused("put"));
        }
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        if self.fail_delete {
            return Err(Self::refused("delete"));
        }
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// S3 backend over `store`, signed by `signer`.
pub fn s3_over(store: FaultyStore, signer: Arc<FakeSigner>) -> Backend {
    Backend::S3(S3Storage::new(Arc::new(store), signer, TEST_BUCKET))
}
