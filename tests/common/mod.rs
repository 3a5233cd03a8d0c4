//! Shared fixtures for HTTP-level tests

#![allow(dead_code)]

use std::sync::Arc;

use dreiattest::{AttestConfig, AttestService, KeyValueStore, MemoryStore, SoftwareAttestor};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const SNONCE: &str = "snonce-1234";

pub fn config(server: &MockServer) -> AttestConfig {
    AttestConfig::new(format!("{}/api", server.uri())).with_uid("tester")
}

pub fn service(config: AttestConfig) -> (AttestService, Arc<SoftwareAttestor>) {
    service_with_store(config, Arc::new(MemoryStore::new()))
}

pub fn service_with_store(
    config: AttestConfig,
    store: Arc<dyn KeyValueStore>,
) -> (AttestService, Arc<SoftwareAttestor>) {
    let attestor = Arc::new(SoftwareAttestor::new());
    let service = AttestService::new(config, attestor.clone(), store).expect("service");
    (service, attestor)
}

/// Nonce endpoint answering with a JSON string, as the server does.
pub async fn mount_nonce(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/dreiattest/nonce"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("\"{}\"", SNONCE)))
        .mount(server)
        .await;
}

pub async fn mount_key_registration(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/api/dreiattest/key"))
        .respond_with(response)
        .mount(server)
        .await;
}

pub async fn requests_to(
    server: &MockServer,
    http_method: &str,
    request_path: &str,
) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == http_method && r.url.path() == request_path)
        .collect()
}

pub fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn get(service: &AttestService, url: String) -> reqwest::Request {
    service.client().get(url).build().expect("request")
}
