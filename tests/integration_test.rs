use std::io::{self, Cursor, Read, Seek, Write};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use mockito::{Matcher, Server};
use tempfile::NamedTempFile;
use yadisk::http::{Forward, Rewindable};
use yadisk::{
    AsyncClient, Backend, Client, Error, ErrorKind, JobOutcome, RequestOptions, Settings,
    StreamPayload, Timeout, WaitOptions,
};

const NOT_FOUND_BODY: &str =
    r#"{"error": "DiskNotFoundError", "description": "Resource not found.", "message": "Не удалось найти запрошенный ресурс."}"#;

fn settings(url: String) -> Settings {
    Settings::new()
        .base_url(url)
        .retry_interval(Duration::ZERO)
        .upload_retry_interval(Duration::ZERO)
}

fn client(backend: Backend, url: String) -> Client {
    Client::with_backend(backend, settings(url))
        .unwrap()
        .with_token("test-token")
        .unwrap()
}

fn async_client(backend: Backend, url: String) -> AsyncClient {
    AsyncClient::with_backend(backend, settings(url))
        .unwrap()
        .with_token("test-token")
        .unwrap()
}

fn fast_wait() -> WaitOptions {
    WaitOptions::new().poll_interval(Duration::from_millis(10))
}

/// An address nothing listens on.
fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

/// Produces `abcdef` one byte at a time, 400ms apart.
struct SlowReader {
    sent: u8,
}

impl Read for SlowReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.sent == 6 || buf.is_empty() {
            return Ok(0);
        }
        thread::sleep(Duration::from_millis(400));
        buf[0] = b'a' + self.sent;
        self.sent += 1;
        Ok(1)
    }
}

fn slow_payload() -> StreamPayload {
    StreamPayload::factory(|| Ok(SlowReader { sent: 0 })).with_len(6)
}

fn one_second() -> Timeout {
    Timeout::new(Duration::from_secs(1), Duration::from_secs(1))
}

/// A listener that completes the handshake but never answers.
fn stalled_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

#[test_log::test]
fn test_server_errors_are_retried_until_exhausted() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let mock = server
            .mock("GET", "/v1/disk/resources/download")
            .match_query(Matcher::UrlEncoded("path".into(), "disk:/a.txt".into()))
            .match_header("Authorization", "OAuth test-token")
            .with_status(503)
            .with_body(r#"{"error": "DiskUnavailableError", "description": "Service unavailable"}"#)
            .expect(3)
            .create();

        let client = client(backend, server.url());
        let options = RequestOptions::new().n_retries(2);
        let err = client.get_download_link("disk:/a.txt", &options).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unavailable, "{}", backend);
        mock.assert();
    }
}

#[test]
fn test_not_found_is_not_retried() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let mock = server
            .mock("GET", "/v1/disk/resources/download")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(NOT_FOUND_BODY)
            .expect(1)
            .create();

        let client = client(backend, server.url());
        let err = client
            .get_download_link("disk:/missing.txt", &RequestOptions::new())
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PathNotFound, "{}", backend);
        assert!(err.kind().is_a(ErrorKind::NotFound));
        assert!(matches!(err, Error::Api(_)));
        mock.assert();
    }
}

#[test]
fn test_upload_puts_payload_without_token() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let link = server
            .mock("GET", "/v1/disk/resources/upload")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("path".into(), "disk:/notes.txt".into()),
                Matcher::UrlEncoded("overwrite".into(), "true".into()),
            ]))
            .match_header("Authorization", "OAuth test-token")
            .with_status(200)
            .with_body(format!(
                r#"{{"href": "{}/upload-target/1", "method": "PUT", "templated": false, "operation_id": "op1"}}"#,
                server.url()
            ))
            .create();
        let put = server
            .mock("PUT", "/upload-target/1")
            .match_header("Authorization", Matcher::Missing)
            .match_body("hello from the client")
            .with_status(201)
            .create();

        let client = client(backend, server.url());
        client
            .upload(
                b"hello from the client".to_vec(),
                "disk:/notes.txt",
                true,
                &RequestOptions::new(),
            )
            .unwrap();

        link.assert();
        put.assert();
    }
}

#[test]
fn test_upload_streams_seekable_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"0123456789").unwrap();
    file.rewind().unwrap();

    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let put = server
            .mock("PUT", "/upload-target/2")
            .match_header("content-length", "10")
            .match_body("0123456789")
            .with_status(201)
            .create();

        let payload = StreamPayload::seekable(file.reopen().unwrap()).unwrap();
        let client = client(backend, server.url());
        client
            .upload_by_link(
                &format!("{}/upload-target/2", server.url()),
                payload,
                &RequestOptions::new(),
            )
            .unwrap();

        put.assert();
    }
}

#[test]
fn test_upload_rejected_status_is_an_error() {
    let mut server = Server::new();
    let put = server
        .mock("PUT", "/upload-target/3")
        .with_status(413)
        .expect(1)
        .create();

    let client = client(Backend::Ureq, server.url());
    let err = client
        .upload_by_link(
            &format!("{}/upload-target/3", server.url()),
            b"too large".to_vec(),
            &RequestOptions::new(),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
    put.assert();
}

#[test]
fn test_download_into_file() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let link = server
            .mock("GET", "/v1/disk/resources/download")
            .match_query(Matcher::UrlEncoded("path".into(), "disk:/photo.bin".into()))
            .with_status(200)
            .with_body(format!(
                r#"{{"href": "{}/download-target/photo.bin", "method": "GET", "templated": false}}"#,
                server.url()
            ))
            .create();
        let content = server
            .mock("GET", "/download-target/photo.bin")
            .match_header("Authorization", Matcher::Missing)
            .with_status(200)
            .with_body("binary-ish content")
            .create();

        let file = NamedTempFile::new().unwrap();
        let mut sink = Rewindable::new(file.reopen().unwrap()).unwrap();
        let client = client(backend, server.url());
        let written = client
            .download("disk:/photo.bin", &mut sink, &RequestOptions::new())
            .unwrap();

        assert_eq!(written, 18);
        assert_eq!(
            std::fs::read_to_string(file.path()).unwrap(),
            "binary-ish content"
        );
        link.assert();
        content.assert();
    }
}

#[test]
fn test_download_by_link_into_memory() {
    let mut server = Server::new();
    let content = server
        .mock("GET", "/download-target/small")
        .with_status(200)
        .with_body("abc")
        .create();

    let client = client(Backend::Reqwest, server.url());
    let mut sink = Forward::new(Cursor::new(Vec::new()));
    let written = client
        .download_by_link(
            &format!("{}/download-target/small", server.url()),
            &mut sink,
            &RequestOptions::new(),
        )
        .unwrap();

    assert_eq!(written, 3);
    assert_eq!(sink.into_inner().into_inner(), b"abc");
    content.assert();
}

#[test]
fn test_copy_waits_for_operation() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let copy = server
            .mock("POST", "/v1/disk/resources/copy")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("from".into(), "disk:/src".into()),
                Matcher::UrlEncoded("path".into(), "disk:/dst".into()),
            ]))
            .with_status(202)
            .with_body(format!(
                r#"{{"href": "{}/v1/disk/operations/op42", "method": "GET", "templated": false}}"#,
                server.url()
            ))
            .create();
        let status = server
            .mock("GET", "/v1/disk/operations/op42")
            .match_header("Authorization", "OAuth test-token")
            .with_status(200)
            .with_body(r#"{"status": "success"}"#)
            .expect(1)
            .create();

        let client = client(backend, server.url());
        let outcome = client
            .copy("disk:/src", "disk:/dst", false, &RequestOptions::new(), &fast_wait())
            .unwrap();

        assert_eq!(outcome, JobOutcome::Completed);
        copy.assert();
        status.assert();
    }
}

#[test]
fn test_copy_without_waiting_returns_handle() {
    let mut server = Server::new();
    server
        .mock("POST", "/v1/disk/resources/copy")
        .match_query(Matcher::Any)
        .with_status(202)
        .with_body(format!(
            r#"{{"href": "{}/v1/disk/operations/op7", "method": "GET", "templated": false}}"#,
            server.url()
        ))
        .create();
    let status = server
        .mock("GET", "/v1/disk/operations/op7")
        .expect(0)
        .create();

    let client = client(Backend::Reqwest, server.url());
    let outcome = client
        .copy(
            "disk:/src",
            "disk:/dst",
            true,
            &RequestOptions::new(),
            &WaitOptions::no_wait(),
        )
        .unwrap();

    assert_eq!(outcome.handle().map(|h| h.id()), Some("op7"));
    status.assert();
}

#[test]
fn test_failed_operation_is_reported() {
    let mut server = Server::new();
    server
        .mock("DELETE", "/v1/disk/trash/resources")
        .with_status(202)
        .with_body(format!(
            r#"{{"href": "{}/v1/disk/operations/op9", "method": "GET", "templated": false}}"#,
            server.url()
        ))
        .create();
    server
        .mock("GET", "/v1/disk/operations/op9")
        .with_status(200)
        .with_body(r#"{"status": "failed"}"#)
        .create();

    let client = client(Backend::Ureq, server.url());
    let err = client
        .remove_trash(None, &RequestOptions::new(), &fast_wait())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::OperationFailed);
}

#[test]
fn test_remove_completes_synchronously() {
    let mut server = Server::new();
    let remove = server
        .mock("DELETE", "/v1/disk/resources")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("path".into(), "disk:/old".into()),
            Matcher::UrlEncoded("permanently".into(), "true".into()),
        ]))
        .with_status(204)
        .create();

    let client = client(Backend::Reqwest, server.url());
    let outcome = client
        .remove("disk:/old", true, &RequestOptions::new(), &fast_wait())
        .unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    remove.assert();
}

#[test]
fn test_connection_refused_is_retried() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let client = client(backend, closed_port_url());
        let options = RequestOptions::new().n_retries(1);
        let err = client
            .get_download_link("disk:/a.txt", &options)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Connection, "{}", backend);
        assert!(err.is_retryable());
    }
}

#[test]
fn test_closed_session_rejects_requests() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/v1/disk/resources/download")
        .match_query(Matcher::Any)
        .expect(0)
        .create();

    let client = client(Backend::Reqwest, server.url());
    client.close();
    let err = client
        .get_download_link("disk:/a.txt", &RequestOptions::new())
        .unwrap_err();

    assert!(matches!(err, Error::SessionClosed));
    mock.assert();
}

#[tokio::test]
async fn test_async_server_errors_are_retried() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/disk/resources/upload")
            .match_query(Matcher::Any)
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let client = async_client(backend, server.url());
        let options = RequestOptions::new().n_retries(1);
        let err = client
            .get_upload_link("disk:/a.txt", false, &options)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InternalServer, "{}", backend);
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_async_upload_and_download() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/disk/resources/upload")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!(
                r#"{{"href": "{}/upload-target/a", "method": "PUT", "templated": false}}"#,
                server.url()
            ))
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/upload-target/a")
            .match_body("async payload")
            .with_status(201)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/disk/resources/download")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(format!(
                r#"{{"href": "{}/download-target/a", "method": "GET", "templated": false}}"#,
                server.url()
            ))
            .create_async()
            .await;
        server
            .mock("GET", "/download-target/a")
            .with_status(200)
            .with_body("async payload")
            .create_async()
            .await;

        let client = async_client(backend, server.url());
        client
            .upload(
                b"async payload".to_vec(),
                "disk:/a.txt",
                true,
                &RequestOptions::new(),
            )
            .await
            .unwrap();
        put.assert_async().await;

        let file = NamedTempFile::new().unwrap();
        let target = tokio::fs::File::create(file.path()).await.unwrap();
        let mut sink = Rewindable::new_async(target).await.unwrap();
        let written = client
            .download("disk:/a.txt", &mut sink, &RequestOptions::new())
            .await
            .unwrap();

        assert_eq!(written, 13, "{}", backend);
        assert_eq!(
            tokio::fs::read_to_string(file.path()).await.unwrap(),
            "async payload"
        );
    }
}

#[tokio::test]
async fn test_async_move_waits_for_operation() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/v1/disk/resources/move")
        .match_query(Matcher::Any)
        .with_status(202)
        .with_body(format!(
            r#"{{"href": "{}/v1/disk/operations/mv1", "method": "GET", "templated": false}}"#,
            server.url()
        ))
        .create_async()
        .await;
    let status = server
        .mock("GET", "/v1/disk/operations/mv1")
        .with_status(200)
        .with_body(r#"{"status": "success", "details": {}}"#)
        .expect(1)
        .create_async()
        .await;

    let client = async_client(Backend::Reqwest, server.url());
    let outcome = client
        .move_("disk:/a", "disk:/b", true, &RequestOptions::new(), &fast_wait())
        .await
        .unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    status.assert_async().await;
}

#[tokio::test]
async fn test_async_closed_session_rejects_requests() {
    let server = Server::new_async().await;

    let client = async_client(Backend::Ureq, server.url());
    client.close();
    let err = client
        .get_download_link("disk:/a.txt", &RequestOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SessionClosed));
}

#[test_log::test]
fn test_slow_upload_is_not_cut_by_read_timeout() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let put = server
            .mock("PUT", "/upload-target/slow")
            .match_body("abcdef")
            .with_status(201)
            .expect(1)
            .create();

        let client = Client::with_backend(backend, settings(server.url()).timeout(one_second()))
            .unwrap();
        let result = client.upload_by_link(
            &format!("{}/upload-target/slow", server.url()),
            slow_payload(),
            &RequestOptions::new().n_retries(0),
        );

        assert!(result.is_ok(), "{}: {:?}", backend, result);
        put.assert();
    }
}

#[test]
fn test_slow_upload_with_per_call_timeout() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let put = server
            .mock("PUT", "/upload-target/slow")
            .match_body("abcdef")
            .with_status(201)
            .expect(1)
            .create();

        let client = client(backend, server.url());
        let options = RequestOptions::new().n_retries(0).timeout(one_second());
        let result = client.upload_by_link(
            &format!("{}/upload-target/slow", server.url()),
            slow_payload(),
            &options,
        );

        assert!(result.is_ok(), "{}: {:?}", backend, result);
        put.assert();
    }
}

#[test]
fn test_silent_server_hits_read_timeout() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let (_listener, url) = stalled_server();
        let client = client(backend, url);
        let options = RequestOptions::new().n_retries(0).timeout(Timeout::new(
            Duration::from_secs(1),
            Duration::from_millis(300),
        ));

        let started = Instant::now();
        let err = client
            .get_download_link("disk:/a.txt", &options)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RequestTimeout, "{}: {}", backend, err);
        assert!(started.elapsed() < Duration::from_secs(5), "{}", backend);
    }
}

#[test]
fn test_concurrent_calls_share_one_session() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new();
        let ok = server
            .mock("GET", "/v1/disk/resources/download")
            .match_query(Matcher::UrlEncoded("path".into(), "disk:/ok".into()))
            .with_status(200)
            .with_body(r#"{"href": "https://downloader/ok", "method": "GET", "templated": false}"#)
            .expect(4)
            .create();
        let busy = server
            .mock("GET", "/v1/disk/resources/download")
            .match_query(Matcher::UrlEncoded("path".into(), "disk:/busy".into()))
            .with_status(503)
            .expect(12)
            .create();

        let client = client(backend, server.url());
        let options = RequestOptions::new().n_retries(2);

        thread::scope(|scope| {
            let mut calls = Vec::new();
            for _ in 0..4 {
                let ok_client = client.clone();
                let options = &options;
                calls.push(scope.spawn(move || ok_client.get_download_link("disk:/ok", options)));
                let busy_client = client.clone();
                calls.push(scope.spawn(move || busy_client.get_download_link("disk:/busy", options)));
            }

            let results: Vec<_> = calls.into_iter().map(|call| call.join().unwrap()).collect();
            let links = results.iter().filter(|r| r.is_ok()).count();
            let unavailable = results
                .iter()
                .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::Unavailable))
                .count();
            assert_eq!((links, unavailable), (4, 4), "{}", backend);
        });

        ok.assert();
        busy.assert();
    }
}

#[tokio::test]
async fn test_async_slow_upload_is_not_cut_by_read_timeout() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new_async().await;
        let put = server
            .mock("PUT", "/upload-target/slow")
            .match_body("abcdef")
            .with_status(201)
            .expect(1)
            .create_async()
            .await;

        let client =
            AsyncClient::with_backend(backend, settings(server.url()).timeout(one_second()))
                .unwrap();
        let result = client
            .upload_by_link(
                &format!("{}/upload-target/slow", server.url()),
                slow_payload(),
                &RequestOptions::new().n_retries(0),
            )
            .await;

        assert!(result.is_ok(), "{}: {:?}", backend, result);
        put.assert_async().await;
    }
}

#[tokio::test]
async fn test_async_silent_server_hits_read_timeout() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let (_listener, url) = stalled_server();
        let client = async_client(backend, url);
        let options = RequestOptions::new().n_retries(0).timeout(Timeout::new(
            Duration::from_secs(1),
            Duration::from_millis(300),
        ));

        let started = Instant::now();
        let err = client
            .get_upload_link("disk:/a.txt", false, &options)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RequestTimeout, "{}: {}", backend, err);
        assert!(started.elapsed() < Duration::from_secs(5), "{}", backend);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_concurrent_calls_share_one_session() {
    for backend in [Backend::Reqwest, Backend::Ureq] {
        let mut server = Server::new_async().await;
        let ok = server
            .mock("GET", "/v1/disk/resources/upload")
            .match_query(Matcher::UrlEncoded("path".into(), "disk:/ok".into()))
            .with_status(200)
            .with_body(r#"{"href": "https://uploader/ok", "method": "PUT", "templated": false}"#)
            .expect(4)
            .create_async()
            .await;
        let busy = server
            .mock("GET", "/v1/disk/resources/upload")
            .match_query(Matcher::UrlEncoded("path".into(), "disk:/busy".into()))
            .with_status(500)
            .expect(8)
            .create_async()
            .await;

        let client = async_client(backend, server.url());
        let mut calls = Vec::new();
        for path in ["disk:/ok", "disk:/busy"].repeat(4) {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                let options = RequestOptions::new().n_retries(1);
                client.get_upload_link(path, true, &options).await
            }));
        }

        let mut links = 0;
        let mut failures = 0;
        for call in calls {
            match call.await.unwrap() {
                Ok(_) => links += 1,
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::InternalServer, "{}", backend);
                    failures += 1;
                }
            }
        }

        assert_eq!((links, failures), (4, 4), "{}", backend);
        ok.assert_async().await;
        busy.assert_async().await;
    }
}
