use std::time::Duration;

use entropy_sync::fetch::{AbortSignal, FetchOutcome, FetchRequest, FetchStats, Fetcher};
use entropy_sync::settings::Timeouts;
use entropy_sync_http::HttpFetcher;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(Timeouts {
        control: Duration::from_secs(2),
        transfer: Duration::from_millis(500),
    })
    .unwrap()
}

async fn mount_file(server: &MockServer, route: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn downloads_to_destination() {
    let server = MockServer::start().await;
    mount_file(&server, "/db/packages.db.light.bz2", b"payload").await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("packages.db.light.bz2");

    let request = FetchRequest::new(format!("{}/db/packages.db.light.bz2", server.uri()), &dest);
    let outcome = fetcher().fetch(&request, &AbortSignal::new()).await;

    assert_eq!(
        outcome,
        FetchOutcome::Success(FetchStats {
            bytes: 7,
            resumed: false
        })
    );
    assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let request = FetchRequest::new(format!("{}/nothing", server.uri()), dir.path().join("x"));
    let outcome = fetcher().fetch(&request, &AbortSignal::new()).await;

    assert_eq!(outcome, FetchOutcome::NotFound);
}

#[tokio::test]
async fn server_error_is_generic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();

    let request = FetchRequest::new(format!("{}/broken", server.uri()), dir.path().join("x"));
    let outcome = fetcher().fetch(&request, &AbortSignal::new()).await;

    assert!(matches!(outcome, FetchOutcome::GenericError(ref e) if e.contains("500")), "{outcome:?}");
}

#[tokio::test]
async fn resume_appends_partial_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big"))
        .and(header("Range", "bytes=6-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"world".to_vec()))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("big");
    std::fs::write(&dest, b"hello ").unwrap();

    let request = FetchRequest::new(format!("{}/big", server.uri()), &dest).resume(true);
    let outcome = fetcher().fetch(&request, &AbortSignal::new()).await;

    assert_eq!(
        outcome,
        FetchOutcome::Success(FetchStats {
            bytes: 5,
            resumed: true
        })
    );
    assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
}

#[tokio::test]
async fn ignored_range_rewrites_file() {
    let server = MockServer::start().await;
    mount_file(&server, "/big", b"hello world").await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("big");
    std::fs::write(&dest, b"hello ").unwrap();

    let request = FetchRequest::new(format!("{}/big", server.uri()), &dest).resume(true);
    let outcome = fetcher().fetch(&request, &AbortSignal::new()).await;

    assert!(matches!(outcome, FetchOutcome::Success(FetchStats { resumed: false, .. })));
    assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
}

#[tokio::test]
async fn digest_mismatch_is_reported() {
    let server = MockServer::start().await;
    mount_file(&server, "/f", b"payload").await;
    let dir = tempfile::tempdir().unwrap();

    let request = FetchRequest::new(format!("{}/f", server.uri()), dir.path().join("f"))
        .expect_md5("00000000000000000000000000000000");
    let outcome = fetcher().fetch(&request, &AbortSignal::new()).await;

    assert_eq!(outcome, FetchOutcome::ChecksumMismatch);
}

#[tokio::test]
async fn stalled_server_times_out_and_keeps_partial() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"late".to_vec())
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("slow");
    std::fs::write(&dest, b"part").unwrap();

    let request = FetchRequest::new(format!("{}/slow", server.uri()), &dest).resume(true);
    let outcome = fetcher().fetch(&request, &AbortSignal::new()).await;

    assert_eq!(outcome, FetchOutcome::Timeout);
    assert_eq!(std::fs::read(&dest).unwrap(), b"part");
}

#[tokio::test]
async fn abort_removes_new_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("slow");
    let abort = AbortSignal::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.interrupt();
    });

    let fetcher = HttpFetcher::new(Timeouts {
        control: Duration::from_secs(10),
        transfer: Duration::from_secs(10),
    })
    .unwrap();
    let request = FetchRequest::new(format!("{}/slow", server.uri()), &dest);
    let outcome = fetcher.fetch(&request, &abort).await;

    assert_eq!(outcome, FetchOutcome::Aborted);
    assert!(!dest.exists());
}

#[tokio::test]
async fn text_probe() {
    let server = MockServer::start().await;
    mount_file(&server, "/db/packages.db.revision", b"12\n").await;

    let fetcher = fetcher();
    assert_eq!(
        fetcher
            .fetch_text(&format!("{}/db/packages.db.revision", server.uri()))
            .await
            .as_deref(),
        Some("12\n")
    );
    assert_eq!(
        fetcher
            .fetch_text(&format!("{}/db/packages.db.download.lock", server.uri()))
            .await,
        None
    );
}

#[tokio::test]
async fn file_urls_are_copied() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("packages.db.revision");
    std::fs::write(&src, b"3").unwrap();
    let dest = dir.path().join("copy");
    let fetcher = fetcher();

    let request = FetchRequest::new(format!("file://{}", src.display()), &dest);
    assert!(fetcher.fetch(&request, &AbortSignal::new()).await.is_success());
    assert_eq!(std::fs::read(&dest).unwrap(), b"3");
    assert_eq!(
        fetcher.fetch_text(&format!("file://{}", src.display())).await.as_deref(),
        Some("3")
    );

    let missing = FetchRequest::new(format!("file://{}/absent", dir.path().display()), &dest);
    assert_eq!(
        fetcher.fetch(&missing, &AbortSignal::new()).await,
        FetchOutcome::NotFound
    );
}
