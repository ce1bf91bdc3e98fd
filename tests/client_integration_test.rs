mod common;

use common::*;
use nextcode_client::prelude::*;
use nextcode_client::{CacheStore, Config};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WORKFLOW_PATH: &str = "/workflow";

async fn mount_workflow_root(server: &MockServer) {
    mount_root(
        server,
        WORKFLOW_PATH,
        json!({
            "health": format!("{}/workflow/health", server.uri()),
            "documentation": format!("{}/workflow/documentation", server.uri()),
            "jobs": format!("{}/workflow/jobs", server.uri()),
        }),
    )
    .await;
}

/// Test exchanging the API key for an access token
#[tokio::test]
async fn test_access_token_exchange() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("client_id=api-key-client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": ACCESS_TOKEN })))
        .expect(1)
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    assert_eq!(client.access_token().await.unwrap(), ACCESS_TOKEN);
    // second call uses the stored token
    let claims = client.decoded_access_token().await.unwrap();
    assert_eq!(claims.email.as_deref(), Some("testuser"));
}

/// Test that an expired API key is reported as an invalid token
#[tokio::test]
async fn test_expired_api_key() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Refresh token expired",
        })))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let err = client.access_token().await.unwrap_err();
    match err {
        NextcodeError::InvalidToken(msg) => assert_eq!(msg, "Refresh token has expired"),
        other => panic!("unexpected error {:?}", other),
    }
}

/// Test the error description from the identity provider is surfaced
#[tokio::test]
async fn test_auth_error_description() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error_description": "Client not allowed",
        })))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let err = client.workflow().await.unwrap_err();
    assert!(matches!(err, NextcodeError::InvalidToken(ref m) if m == "Client not allowed"));
}

/// Test building a client without any credentials
#[tokio::test]
async fn test_missing_profile() {
    let dir = tempfile::tempdir().unwrap();
    let result = NextcodeClient::builder()
        .profile("doesnotexist")
        .config(Config::load_from(dir.path()))
        .build();
    assert!(matches!(result, Err(NextcodeError::InvalidProfile(_))));
}

/// Test building a client from a saved profile
#[tokio::test]
async fn test_client_from_profile() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::load_from(dir.path());
    config.create_profile("test", &api_key(&server), None).unwrap();

    let client = NextcodeClient::builder()
        .profile("test")
        .config(Config::load_from(dir.path()))
        .cache(None)
        .build()
        .unwrap();
    assert_eq!(client.profile_name(), Some("test"));
    assert_eq!(client.root_url(), server.uri());
    assert_eq!(client.available_profiles(), vec!["test"]);
    assert!(format!("{:?}", client).starts_with("<Client test |"));
}

/// Test service status, endpoints, health and documentation
#[tokio::test]
async fn test_service_basics() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_workflow_root(&server).await;

    Mock::given(method("GET"))
        .and(path("/workflow/documentation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "openapi": "3.0.0" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/workflow/health"))
        .and(header("authorization", format!("Bearer {}", ACCESS_TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let svc = client.workflow().await.expect("Failed to open workflow service");

    let status = svc.status(false).await.unwrap();
    assert_eq!(status.service_name.as_deref(), Some("test-service"));
    let status = svc.status(true).await.unwrap();
    assert_eq!(status.build_info, Some(json!({ "version": "1.0" })));

    assert!(svc.endpoints().await.contains_key("jobs"));
    assert_eq!(svc.current_user().await, Some(json!({ "email": "testuser" })));
    assert_eq!(svc.openapi_spec().await.unwrap()["openapi"], "3.0.0");
    assert!(svc.healthy().await);
}

/// Test that an unhealthy service reports false instead of failing
#[tokio::test]
async fn test_service_unhealthy() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_workflow_root(&server).await;

    Mock::given(method("GET"))
        .and(path("/workflow/health"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let svc = client.workflow().await.unwrap();
    assert!(!svc.healthy().await);
}

/// Test that a root endpoint answering with HTML is rejected
#[tokio::test]
async fn test_unexpected_root_response() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    Mock::given(method("GET"))
        .and(path(WORKFLOW_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let err = client.workflow().await.unwrap_err();
    assert!(err.to_string().starts_with("Unexpected response: <html></html>"));
}

/// Test that a 401 refreshes the token and resends the request once
#[tokio::test]
async fn test_unauthorized_refreshes_token() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": ACCESS_TOKEN })))
        .expect(2)
        .mount(&server)
        .await;
    mount_workflow_root(&server).await;

    Mock::given(method("GET"))
        .and(path("/workflow/documentation"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/workflow/documentation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "paths": {} })))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let svc = client.workflow().await.unwrap();
    let spec = svc.openapi_spec().await.expect("Request should succeed after refresh");
    assert_eq!(spec, json!({ "paths": {} }));
}

/// Test that transient server errors are retried for idempotent requests
#[tokio::test]
async fn test_retry_on_server_error() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_workflow_root(&server).await;

    Mock::given(method("GET"))
        .and(path("/workflow/documentation"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/workflow/documentation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let svc = client.workflow().await.unwrap();
    assert!(svc.openapi_spec().await.is_ok());
}

/// Test that POST requests are not retried and server errors carry the body
#[tokio::test]
async fn test_post_not_retried() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_workflow_root(&server).await;

    Mock::given(method("POST"))
        .and(path("/workflow/jobs"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let svc = client.workflow().await.unwrap();
    let request = PostJobRequest {
        pipeline_name: Some("test".into()),
        ..Default::default()
    };
    let err = svc.post_job(request).await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert!(err.to_string().contains("Server error in call to"));
    assert!(err.to_string().contains("Response body: boom"));
}

/// Test error descriptions from the service are used in messages
#[tokio::test]
async fn test_error_description() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_workflow_root(&server).await;

    Mock::given(method("GET"))
        .and(path("/workflow/documentation"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "description": "Bad request", "errors": ["limit"] },
            "code": 400,
        })))
        .mount(&server)
        .await;

    let client = create_test_client(&server);
    let svc = client.workflow().await.unwrap();
    let err = svc.openapi_spec().await.unwrap_err();
    match &err {
        NextcodeError::Server { message, response, .. } => {
            assert_eq!(message, "Bad request ([\"limit\"]) (code 400)");
            assert_eq!(response.as_ref().unwrap()["code"], 400);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

/// Test that root info and token are cached between sessions
#[tokio::test]
async fn test_session_cache() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": ACCESS_TOKEN })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(WORKFLOW_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "endpoints": { "jobs": format!("{}/workflow/jobs", server.uri()) },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let build = || {
        NextcodeClient::builder()
            .api_key(api_key(&server))
            .root_url(server.uri())
            .config(Config::load_from(dir.path()))
            .cache(Some(CacheStore::new(dir.path())))
            .build()
            .unwrap()
    };

    let first = build().workflow().await.unwrap();
    let second = build().workflow().await.unwrap();
    assert_eq!(first.endpoints().await, second.endpoints().await);
}

/// Test that unknown endpoints list what is available
#[tokio::test]
async fn test_unknown_endpoint() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_workflow_root(&server).await;

    let client = create_test_client(&server);
    let svc = client.workflow().await.unwrap();
    let err = svc.get_pipelines().await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Endpoint 'pipelines' is not exported"));
    assert!(msg.contains("documentation, health, jobs"));
}

/// Test that a fixed bearer token replaces the key exchange
#[tokio::test]
async fn test_custom_authentication() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(WORKFLOW_PATH))
        .and(header("authorization", "Bearer static-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "endpoints": {},
            "service_name": "workflow",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = NextcodeClient::builder()
        .api_key(api_key(&server))
        .root_url(server.uri())
        .config(Config::load_from(std::env::temp_dir().join("nextcode-no-config")))
        .auth(nextcode_client::BearerAuth::new("static-token"))
        .cache(None)
        .build()
        .unwrap();
    assert_eq!(client.access_token().await.unwrap(), "static-token");

    let svc = client.workflow().await.expect("Failed to open workflow service");
    assert_eq!(svc.status(false).await.unwrap().service_name.as_deref(), Some("workflow"));
}

/// Test that a server which cannot be reached is reported as such
#[tokio::test]
async fn test_unreachable_server() {
    let root = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };

    let client = NextcodeClient::builder()
        .api_key(api_key_for(&root))
        .config(Config::load_from(std::env::temp_dir().join("nextcode-no-config")))
        .auth(nextcode_client::BearerAuth::new("static-token"))
        .retry(nextcode_client::RetryPolicy::disabled())
        .cache(None)
        .build()
        .unwrap();
    assert_eq!(client.root_url(), root);

    let err = client.workflow().await.unwrap_err();
    assert!(matches!(err, NextcodeError::Server { status: None, .. }));
    assert_eq!(err.to_string(), format!("Could not reach server {}/workflow", root));
}
