//! The storage driver: one operation set over whichever backend is
//! configured, plus presigned URLs and CSP probing for S3.

use std::{
    future::Future,
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use futures::{stream::BoxStream, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    backend::{Backend, S3Storage},
    cache::{PresignedUrl, PresignedUrlCache, URL_VALIDITY},
    signer::content_type_for_key,
    Error,
    Result,
};

/// Key of the empty object written while probing for the CSP origin.
pub const CSP_PROBE_KEY: &str = "gotosocial-csp-probe";

/// Validity of the probe URL. Only its scheme and host are used.
const CSP_PROBE_VALIDITY: Duration = Duration::from_secs(1);

/// Runs `fut` unless `cancel` fires first.
async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Error>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled.into()),
        res = fut => res,
    }
}

/// Blob storage driver.
///
/// Construct one per process (see [`Driver::from_config`]), share it by
/// reference, and call [`Driver::close`] once after in-flight operations
/// have drained.
pub struct Driver {
    backend: Backend,
    proxy: bool,
    presigned_cache: Option<PresignedUrlCache>,
}

impl Driver {
    /// Wraps `backend`. `proxy` disables presigned URLs; `presigned_cache`
    /// is only consulted for backends that can sign.
    pub fn new(backend: Backend, proxy: bool, presigned_cache: Option<PresignedUrlCache>) -> Self {
        Self {
            backend,
            proxy,
            presigned_cache,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn proxy(&self) -> bool {
        self.proxy
    }

    pub fn presigned_cache(&self) -> Option<&PresignedUrlCache> {
        self.presigned_cache.as_ref()
    }

    /// Returns the bytes stored at `key`.
    pub async fn get(&self, cancel: &CancellationToken, key: &str) -> Result<Bytes> {
        cancellable(cancel, self.backend.read_bytes(key)).await
    }

    /// Returns a stream over the bytes stored at `key`. The stream is owned
    /// by the caller; dropping it releases the underlying reader.
    pub async fn get_stream(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        cancellable(cancel, self.backend.read_stream(key)).await
    }

    /// Stores `value` at `key`. Fails with [`Error::AlreadyExists`] rather
    /// than overwriting.
    pub async fn put(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<usize> {
        cancellable(cancel, self.backend.write_bytes(key, value.into())).await
    }

    /// Stores the chunks of `data` at `key` without collecting them in
    /// memory. A cancelled upload is aborted rather than left partial.
    pub async fn put_stream<S>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        data: S,
    ) -> Result<u64>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    {
        self.backend.write_stream(key, data, cancel).await
    }

    pub async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        cancellable(cancel, self.backend.remove(key)).await
    }

    pub async fn has(&self, cancel: &CancellationToken, key: &str) -> Result<bool> {
        cancellable(cancel, self.backend.stat(key)).await
    }

    /// Calls `walk` for every stored key. See [`Backend::walk_keys`].
    pub async fn walk_keys<E, F>(&self, cancel: &CancellationToken, walk: F) -> Result<(), E>
    where
        F: FnMut(&str) -> Result<(), E>,
        E: From<Error>,
    {
        cancellable(cancel, self.backend.walk_keys(walk)).await
    }

    /// Stops the URL cache sweeper and releases the backend.
    pub fn close(&self) -> Result<()> {
        if let Some(cache) = &self.presigned_cache {
            cache.stop();
        }
        self.backend.close()
    }

    /// Returns a presigned GET URL for `key`, but only when running on S3
    /// with proxying disabled.
    ///
    /// Never fails: when no URL can be produced the caller serves the bytes
    /// through [`Driver::get`] or [`Driver::get_stream`] instead.
    pub async fn url(&self, cancel: &CancellationToken, key: &str) -> Option<PresignedUrl> {
        let s3 = self.signing_backend()?;

        let sign = move || async move {
            let content_type = content_type_for_key(key);
            match s3.presign_get(key, URL_VALIDITY, content_type.as_deref()).await {
                Ok(url) => Some(PresignedUrl {
                    url,
                    expiry: SystemTime::now() + URL_VALIDITY,
                }),
                Err(err) => {
                    debug!(key, error = %err, "presigning failed, falling back to proxied reads");
                    None
                }
            }
        };

        let lookup = async {
            match &self.presigned_cache {
                Some(cache) => cache.get_or_sign(key, sign).await,
                None => sign().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            url = lookup => url,
        }
    }

    /// Returns the `scheme://host` origin that presigned URLs from this
    /// driver point at, for use in a content-security-policy.
    ///
    /// Returns an empty string when the driver is not backed by non-proxying
    /// S3. Otherwise:
    ///
    ///  1. Write an empty object at [`CSP_PROBE_KEY`].
    ///  2. Presign a short-lived URL for it.
    ///  3. Delete the object, logging a warning if that fails.
    ///  4. Return the URL stripped to scheme and host.
    pub async fn probe_csp_uri(&self, cancel: &CancellationToken) -> Result<String> {
        let Some(s3) = self.signing_backend() else {
            return Ok(String::new());
        };

        match self.put(cancel, CSP_PROBE_KEY, Bytes::new()).await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {
                debug!(key = CSP_PROBE_KEY, "reusing csp probe object left by an earlier probe");
            }
            Err(Error::Cancelled) => {
                // The write may have landed before it was abandoned.
                self.remove_probe_object().await;
                return Err(Error::Cancelled);
            }
            Err(err) => {
                return Err(Error::ProbeWrite {
                    key: CSP_PROBE_KEY.to_string(),
                    source: Box::new(err),
                })
            }
        }

        let signed =
            cancellable(cancel, s3.presign_get(CSP_PROBE_KEY, CSP_PROBE_VALIDITY, None)).await;

        // Runs on every path once the probe object exists, including when the
        // caller cancelled while signing.
        self.remove_probe_object().await;

        Ok(origin(&signed?))
    }

    /// Deletes the probe object, ignoring the caller's token. Failure only
    /// warns; a missing object is fine.
    async fn remove_probe_object(&self) {
        match self.backend.remove(CSP_PROBE_KEY).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!(
                key = CSP_PROBE_KEY,
                error = %err,
                "failed to delete csp probe object; you may want to remove it from the bucket manually"
            ),
        }
    }

    fn signing_backend(&self) -> Option<&S3Storage> {
        if self.proxy {
            return None;
        }
        self.backend.as_s3()
    }
}

/// `scheme://host[:port]` of `url`, dropping path, query and signature.
fn origin(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{port}"));
    }
    origin
}
