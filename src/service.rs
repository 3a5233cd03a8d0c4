//! Request interception: scope, bypass, signing, and invalid-key retry.
//!
//! ```text
//!             ┌─ out of scope ─────────────────────────────▶ send unchanged
//! request ────┼─ shared secret ─▶ Uid + Shared-Secret ─────▶ send
//!             └─ otherwise ─────▶ get_key ─▶ sign ─────────▶ send
//!
//! response 403 + dreiAttest_invalid_key
//!   first time  → evict the key that signed it, adapt and send again
//!   second time → InvalidKey
//! ```

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Request, Response, StatusCode, Url};
use tracing::{debug, info, warn};

use crate::attestor::{Attestor, KeyId};
use crate::config::AttestConfig;
use crate::error::{AttestError, Result};
use crate::identity::{IdentityStore, ServiceUid};
use crate::lifecycle::KeyLifecycleManager;
use crate::protocol::{is_subpath, ERROR_HEADER, SHARED_SECRET_HEADER, UID_HEADER};
use crate::registrar::{HttpKeyRegistrar, KeyRegistrar};
use crate::signer::{check_reserved_headers, header_value, RequestSigner};
use crate::store::KeyValueStore;

/// What to do with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    DoNotRetry,
    /// Invalidate the cached key and send the request once more
    Retry,
    Fail(AttestError),
}

impl RetryDecision {
    /// Decide on a response. `attempt` counts from zero.
    pub fn evaluate(
        in_scope: bool,
        status: StatusCode,
        error_header: Option<&str>,
        attempt: u32,
    ) -> Self {
        if !in_scope || status != StatusCode::FORBIDDEN {
            return RetryDecision::DoNotRetry;
        }

        let invalid_key = error_header
            .map(|code| AttestError::from_server_code(code).is_invalid_key())
            .unwrap_or(false);
        if !invalid_key {
            return RetryDecision::DoNotRetry;
        }

        if attempt == 0 {
            RetryDecision::Retry
        } else {
            RetryDecision::Fail(AttestError::InvalidKey)
        }
    }
}

/// Attests requests for one logical user against one server.
pub struct AttestService {
    config: AttestConfig,
    base_url: Url,
    client: Client,
    service_uid: ServiceUid,
    lifecycle: KeyLifecycleManager,
    signer: RequestSigner,
}

impl AttestService {
    /// Service talking to the server at `config.base_url` for registration.
    pub fn new(
        config: AttestConfig,
        attestor: Arc<dyn Attestor>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let client = http_client(&config)?;
        let registrar = Arc::new(HttpKeyRegistrar::new(
            client.clone(),
            config.base_url()?,
            Arc::clone(&attestor),
        ));
        Self::assemble(config, client, attestor, store, registrar)
    }

    /// Service with a custom registrar.
    pub fn with_registrar(
        config: AttestConfig,
        attestor: Arc<dyn Attestor>,
        store: Arc<dyn KeyValueStore>,
        registrar: Arc<dyn KeyRegistrar>,
    ) -> Result<Self> {
        let client = http_client(&config)?;
        Self::assemble(config, client, attestor, store, registrar)
    }

    fn assemble(
        config: AttestConfig,
        client: Client,
        attestor: Arc<dyn Attestor>,
        store: Arc<dyn KeyValueStore>,
        registrar: Arc<dyn KeyRegistrar>,
    ) -> Result<Self> {
        config.validate()?;

        if config.shared_secret.is_none() && !attestor.is_supported() {
            return Err(AttestError::NotSupported);
        }

        let base_url = config.base_url()?;
        let identities = Arc::new(IdentityStore::new(store));
        let service_uid = identities.service_uid(&config.uid);
        let lifecycle = KeyLifecycleManager::new(
            identities,
            Arc::clone(&attestor),
            registrar,
            config.max_concurrent_registrations,
        );
        let signer = RequestSigner::new(attestor, config.validation_level);

        info!(
            base_url = %base_url,
            service_uid = %service_uid,
            bypass = config.shared_secret.is_some(),
            "Attestation service ready"
        );

        Ok(Self {
            config,
            base_url,
            client,
            service_uid,
            lifecycle,
            signer,
        })
    }

    pub fn config(&self) -> &AttestConfig {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn service_uid(&self) -> &ServiceUid {
        &self.service_uid
    }

    /// Currently cached key, if any.
    pub fn key_id(&self) -> Option<KeyId> {
        self.lifecycle.identities().cached_key(&self.service_uid)
    }

    /// Whether `url` is below the base URL.
    pub fn in_scope(&self, url: &Url) -> bool {
        is_subpath(url, &self.base_url)
    }

    /// Add attestation headers to an in-scope request.
    ///
    /// Out-of-scope requests are returned unchanged. Registers a key first
    /// if none is cached.
    pub async fn adapt(&self, request: Request) -> Result<Request> {
        self.adapt_with_key(request).await.map(|(request, _)| request)
    }

    /// Like [`adapt`](Self::adapt), also returning the key that signed the request.
    ///
    /// The key is `None` for out-of-scope and shared-secret requests.
    pub async fn adapt_with_key(&self, mut request: Request) -> Result<(Request, Option<KeyId>)> {
        if !self.in_scope(request.url()) {
            debug!(url = %request.url(), "Request out of scope, passing through");
            return Ok((request, None));
        }

        check_reserved_headers(request.headers())?;

        if let Some(secret) = &self.config.shared_secret {
            let headers = request.headers_mut();
            headers.insert(UID_HEADER, header_value(self.service_uid.as_str())?);
            headers.insert(SHARED_SECRET_HEADER, header_value(secret)?);
            return Ok((request, None));
        }

        let key_id = self.lifecycle.get_key(&self.service_uid).await?;
        let request = self.signer.sign(request, &self.service_uid, &key_id).await?;
        Ok((request, Some(key_id)))
    }

    /// Adapt and send `request`, renewing the key once if the server rejects it.
    ///
    /// Only the key that signed the rejected request is evicted, so a
    /// replacement registered for a concurrent request is kept.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let in_scope = self.in_scope(request.url());
        let mut retry_copy = request.try_clone();
        let mut request = request;
        let mut attempt = 0;

        loop {
            let (adapted, signing_key) = self.adapt_with_key(request).await?;
            let response = self.client.execute(adapted).await?;
            let error_code = response
                .headers()
                .get(ERROR_HEADER)
                .and_then(|v| v.to_str().ok());

            match RetryDecision::evaluate(in_scope, response.status(), error_code, attempt) {
                RetryDecision::DoNotRetry => return Ok(response),
                RetryDecision::Fail(e) => {
                    warn!(service_uid = %self.service_uid, "Server rejected renewed key");
                    return Err(e);
                }
                RetryDecision::Retry => {
                    info!(service_uid = %self.service_uid, "Server rejected key, renewing");
                    if let Some(stale_key) = &signing_key {
                        self.lifecycle.invalidate_if(&self.service_uid, stale_key).await;
                    }
                    request = retry_copy.take().ok_or(AttestError::InvalidKey)?;
                    retry_copy = request.try_clone();
                    attempt += 1;
                }
            }
        }
    }

    /// Drop the cached key locally.
    pub fn invalidate_key(&self) {
        self.lifecycle.invalidate(&self.service_uid);
    }

    /// Drop the cached key and revoke it on the server (best effort).
    pub async fn deregister_key(&self) {
        self.lifecycle.deregister(&self.service_uid).await;
    }

    /// Cancel key registrations that have not started.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }
}

fn http_client(config: &AttestConfig) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestor::SoftwareAttestor;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use reqwest::header::HeaderValue;
    use reqwest::Method;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingRegistrar {
        registrations: AtomicU32,
    }

    #[async_trait]
    impl KeyRegistrar for CountingRegistrar {
        async fn register_new_key(&self, _key_id: &KeyId, _uid: &ServiceUid) -> Result<()> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deregister_key(&self, _key_id: &KeyId, _uid: &ServiceUid) -> Result<()> {
            Ok(())
        }
    }

    fn request(url: &str) -> Request {
        Request::new(Method::GET, Url::parse(url).unwrap())
    }

    fn service(
        config: AttestConfig,
    ) -> (AttestService, Arc<SoftwareAttestor>, Arc<CountingRegistrar>) {
        let attestor = Arc::new(SoftwareAttestor::new());
        let registrar = Arc::new(CountingRegistrar::default());
        let service = AttestService::with_registrar(
            config,
            attestor.clone(),
            Arc::new(MemoryStore::new()),
            registrar.clone(),
        )
        .unwrap();
        (service, attestor, registrar)
    }

    #[test]
    fn test_retry_decision() {
        let invalid = Some("dreiAttest_invalid_key");
        assert_eq!(
            RetryDecision::evaluate(true, StatusCode::FORBIDDEN, invalid, 0),
            RetryDecision::Retry
        );
        assert_eq!(
            RetryDecision::evaluate(true, StatusCode::FORBIDDEN, invalid, 1),
            RetryDecision::Fail(AttestError::InvalidKey)
        );
        assert_eq!(
            RetryDecision::evaluate(false, StatusCode::FORBIDDEN, invalid, 0),
            RetryDecision::DoNotRetry
        );
        assert_eq!(
            RetryDecision::evaluate(true, StatusCode::UNAUTHORIZED, invalid, 0),
            RetryDecision::DoNotRetry
        );
        assert_eq!(
            RetryDecision::evaluate(
                true,
                StatusCode::FORBIDDEN,
                Some("dreiAttest_policy_violation"),
                0
            ),
            RetryDecision::DoNotRetry
        );
        assert_eq!(
            RetryDecision::evaluate(true, StatusCode::FORBIDDEN, None, 0),
            RetryDecision::DoNotRetry
        );
    }

    #[tokio::test]
    async fn test_out_of_scope_passthrough() {
        let (service, attestor, registrar) = service(AttestConfig::new("https://h/api"));

        let adapted = service.adapt(request("https://other/api/x")).await.unwrap();
        assert!(adapted.headers().is_empty());
        assert_eq!(adapted.url().as_str(), "https://other/api/x");
        assert_eq!(attestor.total_calls(), 0);
        assert_eq!(registrar.registrations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_signing_path_registers_once() {
        let (service, attestor, registrar) =
            service(AttestConfig::new("https://h/api").with_uid("alice"));

        let first = service.adapt(request("https://h/api/one")).await.unwrap();
        let second = service.adapt(request("https://h/api/two")).await.unwrap();

        for adapted in [&first, &second] {
            assert_eq!(adapted.headers()[&UID_HEADER], service.service_uid().as_str());
            assert!(adapted.headers().contains_key(crate::protocol::SIGNATURE_HEADER));
        }
        assert_eq!(registrar.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(attestor.assertion_count(), 2);
        assert!(service.key_id().is_some());
        assert!(service.service_uid().as_str().starts_with("alice;"));
    }

    #[tokio::test]
    async fn test_bypass_skips_attestor() {
        let (service, attestor, registrar) =
            service(AttestConfig::new("https://h/api").with_shared_secret("s3cret"));

        let adapted = service.adapt(request("https://h/api/x")).await.unwrap();
        assert_eq!(adapted.headers()[&SHARED_SECRET_HEADER], "s3cret");
        assert_eq!(adapted.headers()[&UID_HEADER], service.service_uid().as_str());
        assert_eq!(attestor.total_calls(), 0);
        assert_eq!(registrar.registrations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reserved_headers_rejected_in_both_paths() {
        let configs = [
            AttestConfig::new("https://h/api"),
            AttestConfig::new("https://h/api").with_shared_secret("s3cret"),
        ];

        for config in configs {
            let (service, _, _) = service(config);
            let mut req = request("https://h/api/x");
            req.headers_mut()
                .insert(crate::protocol::NONCE_HEADER, HeaderValue::from_static("x"));
            assert_eq!(service.adapt(req).await.unwrap_err(), AttestError::IllegalHeaders);
        }
    }

    #[test]
    fn test_unsupported_without_secret() {
        let attestor = Arc::new(SoftwareAttestor::new().with_supported(false));
        let result = AttestService::with_registrar(
            AttestConfig::new("https://h/api"),
            attestor.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(CountingRegistrar::default()),
        );
        assert!(matches!(result, Err(AttestError::NotSupported)));

        let result = AttestService::with_registrar(
            AttestConfig::new("https://h/api").with_shared_secret("s3cret"),
            attestor,
            Arc::new(MemoryStore::new()),
            Arc::new(CountingRegistrar::default()),
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_and_shutdown() {
        let (service, _, registrar) = service(AttestConfig::new("https://h/api"));

        service.adapt(request("https://h/api/x")).await.unwrap();
        service.invalidate_key();
        assert!(service.key_id().is_none());

        service.shutdown();
        assert_eq!(
            service.adapt(request("https://h/api/x")).await.unwrap_err(),
            AttestError::Cancelled
        );
        assert_eq!(registrar.registrations.load(Ordering::SeqCst), 1);
    }
}
