//! Report submission over a real socket with the reqwest transport.

mod common;

use common::report;
use shared::capabilities::{HttpError, ReqwestHttpClient, ValidatedUrl, MAX_RESPONSE_BODY_SIZE};
use shared::submission::{ReportSubmissionClient, SubmissionError};
use shared::{Credentials, EvidenceUri, QueueEntryId, Session, UserId};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn request_complete(buf: &[u8]) -> bool {
    let Some(header_end) = find(buf, b"\r\n\r\n") else {
        return false;
    };
    let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok());
    match content_length {
        Some(len) => buf.len() >= header_end + 4 + len,
        None => buf.ends_with(b"0\r\n\r\n"),
    }
}

/// Accepts one connection, answers with `status` and `body`, returns the raw request.
async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    serve_raw(format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ))
    .await
}

/// Like [`serve_once`], but writes `response` verbatim.
async fn serve_raw(response: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if request_complete(&buf) {
                break;
            }
        }

        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
        String::from_utf8_lossy(&buf).into_owned()
    });

    (base, handle)
}

fn client(base: &str, credentials: Credentials) -> ReportSubmissionClient<ReqwestHttpClient> {
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    ReportSubmissionClient::new(
        Arc::new(ReqwestHttpClient::with_client(http)),
        &ValidatedUrl::new(base).unwrap(),
        5_000,
        credentials,
    )
    .unwrap()
}

#[tokio::test]
async fn multipart_request_on_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let png = dir.path().join("IMG_0001.png");
    let heic = dir.path().join("IMG_0002.heic");
    std::fs::write(&png, b"first-photo-bytes").unwrap();
    std::fs::write(&heic, b"second-photo-bytes").unwrap();

    let mut report = report("wire");
    report.evidences = vec![
        EvidenceUri::new(png.to_string_lossy()),
        EvidenceUri::new(url::Url::from_file_path(&heic).unwrap().to_string()),
    ];

    let (base, server) = serve_once("201 Created", r#"{"_id":"srv-1"}"#).await;
    let session = Session::new(UserId::new("citizen-9"), "tok-w").unwrap();
    let client = client(&base, Credentials::signed_in(session));

    let body = client
        .submit(
            &report,
            Some(&UserId::new("citizen-9")),
            Some(&QueueEntryId::new("entry-77")),
        )
        .await
        .unwrap();
    assert_eq!(body["_id"], "srv-1");

    let raw = server.await.unwrap();
    let lower = raw.to_lowercase();

    assert!(raw.starts_with("POST /api/report/create HTTP/1.1\r\n"));
    assert!(lower.contains("content-type: multipart/form-data; boundary="));
    assert!(lower.contains("authorization: bearer tok-w"));
    assert!(lower.contains("idempotency-key: entry-77"));

    assert!(raw.contains("name=\"userId\"\r\n\r\ncitizen-9\r\n"));
    assert!(raw.contains("name=\"locationInfo\""));
    assert!(raw.contains("name=\"personalInfo\""));
    assert!(raw.contains("\"species\":\"skipjack tuna\""));

    assert!(raw.contains("name=\"evidence\"; filename=\"evidence_0.jpg\""));
    assert!(raw.contains("name=\"evidence\"; filename=\"evidence_1.jpg\""));
    assert_eq!(lower.matches("content-type: image/jpeg").count(), 2);
    assert!(raw.contains("first-photo-bytes"));
    assert!(raw.contains("second-photo-bytes"));
    assert!(!raw.contains("IMG_0001"));
}

#[tokio::test]
async fn server_error_carries_status_and_body() {
    let (base, server) = serve_once("500 Internal Server Error", "database down").await;
    let client = client(&base, Credentials::new());

    let err = client.submit(&report("x"), None, None).await.unwrap_err();
    server.await.unwrap();

    match err {
        SubmissionError::Http(HttpError::HttpStatus {
            status, message, ..
        }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "database down");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn non_json_success_is_malformed() {
    let (base, server) = serve_once("200 OK", "created").await;
    let client = client(&base, Credentials::new());

    let err = client.submit(&report("x"), None, None).await.unwrap_err();
    let raw = server.await.unwrap();

    assert!(matches!(err, SubmissionError::MalformedResponse { status: 200, .. }));
    assert!(!raw.contains("name=\"userId\""));
}

#[tokio::test]
async fn refused_connection_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let err = client(&base, Credentials::new())
        .submit(&report("x"), None, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SubmissionError::Http(HttpError::ConnectionError { .. })
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn unreadable_evidence_fails_before_sending() {
    let mut report = report("x");
    report.evidences = vec![EvidenceUri::new("/no/such/photo.jpg")];

    let err = client("http://127.0.0.1:9", Credentials::new())
        .submit(&report, None, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SubmissionError::Http(HttpError::Attachment { .. })
    ));
}

#[tokio::test]
async fn oversized_response_rejected_before_reading_body() {
    let declared = MAX_RESPONSE_BODY_SIZE + 1;
    let (base, server) = serve_raw(format!(
        "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: {declared}\r\nConnection: close\r\n\r\n{{\"_id\":"
    ))
    .await;

    let err = client(&base, Credentials::new())
        .submit(&report("x"), None, None)
        .await
        .unwrap_err();
    server.await.unwrap();

    match err {
        SubmissionError::Http(HttpError::ResponseTooLarge { size, max }) => {
            assert_eq!(size, declared);
            assert_eq!(max, MAX_RESPONSE_BODY_SIZE);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
