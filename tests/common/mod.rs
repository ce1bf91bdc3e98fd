#![allow(dead_code)]

use base64::{engine::general_purpose, Engine};
use nextcode_client::{Config, NextcodeClient, RetryPolicy};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const REALM_PATH: &str = "/auth/realms/wuxinextcode.com";
pub const ACCESS_TOKEN: &str = "eyJhbGciOiJSUzI1NiJ9.eyJlbWFpbCI6InRlc3R1c2VyIn0.c2ln";

/// API key whose issuer points at the mock server
pub fn api_key(server: &MockServer) -> String {
    api_key_for(&server.uri())
}

/// API key whose issuer lives under `root`
pub fn api_key_for(root: &str) -> String {
    let payload = json!({
        "iss": format!("{}{}", root, REALM_PATH),
        "azp": "api-key-client",
        "typ": "Offline",
    });
    format!(
        "eyJhbGciOiJSUzI1NiJ9.{}.c2lnbmF0dXJl",
        general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}

pub fn token_path() -> String {
    format!("{}/protocol/openid-connect/token", REALM_PATH)
}

/// Identity provider handing out `ACCESS_TOKEN`
pub async fn mount_auth(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": ACCESS_TOKEN })))
        .mount(server)
        .await;
}

/// Root document of a service mounted at `service_path`
pub async fn mount_root(server: &MockServer, service_path: &str, endpoints: Value) {
    Mock::given(method("GET"))
        .and(path(service_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "endpoints": endpoints,
            "current_user": { "email": "testuser" },
            "service_name": "test-service",
            "build_info": { "version": "1.0" },
            "app_info": {},
        })))
        .mount(server)
        .await;
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        backoff_factor: Duration::from_millis(10),
        ..RetryPolicy::default()
    }
}

/// Client talking to the mock server, without session cache
pub fn create_test_client(server: &MockServer) -> NextcodeClient {
    NextcodeClient::builder()
        .api_key(api_key(server))
        .root_url(server.uri())
        .project("testproject")
        .config(Config::load_from(std::env::temp_dir().join("nextcode-no-config")))
        .retry(fast_retry())
        .cache(None)
        .build()
        .expect("Failed to create client")
}
