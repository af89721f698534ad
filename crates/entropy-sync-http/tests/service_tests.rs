use std::collections::BTreeSet;
use std::time::Duration;

use entropy_sync::repository::{RepositoryId, ServiceEndpoint};
use entropy_sync::service::{
    DiffReply, PackageDiff, RepositoryQuery, ServiceConnection, ServiceConnector, ServiceError,
};
use entropy_sync_http::HttpServiceConnector;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(2);

fn endpoint(server: &MockServer) -> ServiceEndpoint {
    ServiceEndpoint {
        host: server.address().ip().to_string(),
        port: server.address().port(),
    }
}

fn query() -> RepositoryQuery {
    RepositoryQuery {
        repository: RepositoryId::new("main"),
        arch: "amd64".into(),
        product: "standard".into(),
        branch: "4".into(),
    }
}

async fn mount_service(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/eapi3/hello"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/eapi3/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "session": "s1" })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/eapi3/session/close"))
        .and(body_partial_json(json!({ "session": "s1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn session_and_differential_round_trip() {
    let server = MockServer::start().await;
    mount_service(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi3/differential"))
        .and(body_partial_json(json!({
            "session": "s1",
            "ids": [1, 2],
            "query": { "repository": "main", "arch": "amd64" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "added": [3],
            "removed": [1],
            "secure_checksum": "abc"
        })))
        .mount(&server)
        .await;

    let connector = HttpServiceConnector::new().unwrap();
    let mut conn = connector.connect(&endpoint(&server), TIMEOUT).await.unwrap();
    let session = conn.open_session().await.unwrap();
    assert_eq!(session.as_str(), "s1");

    let reply = conn
        .differential_comparison(&session, &query(), &BTreeSet::from([1, 2]))
        .await
        .unwrap();
    assert_eq!(
        DiffReply::classify(reply),
        DiffReply::Diff(PackageDiff {
            added: vec![3],
            removed: vec![1],
            secure_checksum: "abc".into(),
        })
    );

    conn.close_session(&session).await.unwrap();
    conn.disconnect().await;
}

#[tokio::test]
async fn locked_reply_is_passed_through() {
    let server = MockServer::start().await;
    mount_service(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi3/packages"))
        .and(body_partial_json(json!({ "ids": [4, 5] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(false)))
        .mount(&server)
        .await;

    let connector = HttpServiceConnector::new().unwrap();
    let mut conn = connector.connect(&endpoint(&server), TIMEOUT).await.unwrap();
    let session = conn.open_session().await.unwrap();

    let reply = conn.package_records(&session, &query(), &[4, 5]).await.unwrap();
    assert_eq!(reply, json!(false));
    conn.close_session(&session).await.unwrap();
}

#[tokio::test]
async fn http_errors_are_protocol_errors() {
    let server = MockServer::start().await;
    mount_service(&server).await;
    Mock::given(method("POST"))
        .and(path("/eapi3/metadata"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let connector = HttpServiceConnector::new().unwrap();
    let mut conn = connector.connect(&endpoint(&server), TIMEOUT).await.unwrap();
    let session = conn.open_session().await.unwrap();

    let err = conn.repository_metadata(&session, &query()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Protocol(ref m) if m.contains("500")), "{err:?}");
    conn.close_session(&session).await.unwrap();
}

#[tokio::test]
async fn session_reply_without_token_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/eapi3/hello"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/eapi3/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let connector = HttpServiceConnector::new().unwrap();
    let mut conn = connector.connect(&endpoint(&server), TIMEOUT).await.unwrap();

    assert!(matches!(conn.open_session().await, Err(ServiceError::Protocol(_))));
}

#[tokio::test]
async fn unavailable_service_fails_to_connect() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/eapi3/hello"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let connector = HttpServiceConnector::new().unwrap();

    let err = connector.connect(&endpoint(&server), TIMEOUT).await.err().unwrap();
    assert!(matches!(err, ServiceError::Connect(_)), "{err:?}");

    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let nobody = ServiceEndpoint {
        host: "127.0.0.1".into(),
        port: closed,
    };
    let err = connector.connect(&nobody, TIMEOUT).await.err().unwrap();
    assert!(matches!(err, ServiceError::Connect(_)), "{err:?}");
}
