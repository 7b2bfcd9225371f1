//! Integration tests for the transfer client against a canned HTTP server.

use dmerge_core::object::ObjectId;
use dmerge_core::protocol::ResponseMessage;
use dmerge_core::transfer::{Client, ClientIdentity, DeconflictRequest, TransferError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn test_client(url: &str) -> Client {
    Client::new(
        url,
        "test-token",
        ClientIdentity {
            version: "0.1.0".to_string(),
            git_version: "git version 2.44.0".to_string(),
        },
    )
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

fn parse_content_length(headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(headers);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

/// Accept one connection, read one full request, answer with `response`,
/// and hand back the raw request bytes.
async fn serve(response: Vec<u8>) -> (String, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut req = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            req.extend_from_slice(&buf[..n]);
            if let Some(pos) = find(&req, b"\r\n\r\n") {
                let total = pos + 4 + parse_content_length(&req[..pos]);
                while req.len() < total {
                    let n = sock.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    req.extend_from_slice(&buf[..n]);
                }
                break;
            }
        }
        sock.write_all(&response).await.unwrap();
        sock.shutdown().await.ok();
        req
    });
    (format!("http://{}", addr), handle)
}

fn http_response(status_line: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status_line).into_bytes();
    for (name, value) in headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(
        format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()).as_bytes(),
    );
    out.extend_from_slice(body);
    out
}

fn multipart_body(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (content_type, data) in parts {
        out.extend_from_slice(b"--BOUNDARY\r\nContent-Type: ");
        out.extend_from_slice(content_type.as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"--BOUNDARY--\r\n");
    out
}

fn ok_response(body: &[u8]) -> Vec<u8> {
    http_response(
        "200 OK",
        &[
            ("DMerge-Server-API-Version", "1"),
            ("Content-Type", "multipart/mixed; boundary=BOUNDARY"),
        ],
        body,
    )
}

#[tokio::test]
async fn test_streams_parts_in_order() {
    let payload: &[u8] = b"\x00pack\xffbytes";
    let body = multipart_body(&[
        ("application/json", br#"{"stdout": "analyzing\n"}"#),
        ("application/octet-stream", payload),
    ]);
    let (url, server) = serve(ok_response(&body)).await;

    let mut stream = test_client(&url).root().await.unwrap();

    match stream.next().await.unwrap().unwrap() {
        ResponseMessage::Control(ctl) => assert_eq!(ctl.stdout, "analyzing\n"),
        other => panic!("expected control message, got: {:?}", other),
    }
    match stream.next().await.unwrap().unwrap() {
        ResponseMessage::Binary(data) => assert_eq!(&data[..], payload),
        other => panic!("expected binary message, got: {:?}", other),
    }
    assert!(stream.next().await.is_none());

    let request = server.await.unwrap();
    let text = String::from_utf8_lossy(&request);
    assert!(text.starts_with("GET /cli/root HTTP/1.1"));
    assert!(text.contains("authorization: Bearer test-token"));
    assert!(text.contains("dmerge-client-api-version: 1"));
}

#[tokio::test]
async fn test_non_200_is_terminal() {
    let response = http_response("403 Forbidden", &[], b"token expired");
    let (url, _server) = serve(response).await;

    let err = test_client(&url).check_auth().await.unwrap_err();
    match err {
        TransferError::UnexpectedStatus { status, body, .. } => {
            assert_eq!(status, 403);
            assert_eq!(body, "token expired");
        }
        other => panic!("expected UnexpectedStatus, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_version_mismatch_yields_no_messages() {
    let body = multipart_body(&[("application/json", br#"{"stdout": "hi"}"#)]);
    let response = http_response(
        "200 OK",
        &[
            ("DMerge-Server-API-Version", "2"),
            ("Content-Type", "multipart/mixed; boundary=BOUNDARY"),
        ],
        &body,
    );
    let (url, _server) = serve(response).await;

    let err = test_client(&url).root().await.unwrap_err();
    match err {
        TransferError::VersionMismatch { expected, got } => {
            assert_eq!(expected, "1");
            assert_eq!(got, "2");
        }
        other => panic!("expected VersionMismatch, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_non_multipart_content_type_is_rejected() {
    let response = http_response(
        "200 OK",
        &[
            ("DMerge-Server-API-Version", "1"),
            ("Content-Type", "application/json"),
        ],
        b"{}",
    );
    let (url, _server) = serve(response).await;

    let err = test_client(&url).root().await.unwrap_err();
    assert!(matches!(err, TransferError::UnsupportedContentType(_)));
}

#[tokio::test]
async fn test_deconflict_upload_carries_metadata_and_pack() {
    let body = multipart_body(&[("application/json", br#"{"stdout": "merged\n"}"#)]);
    let (url, server) = serve(ok_response(&body)).await;

    let pack = b"PACKDATA".to_vec();
    let req = DeconflictRequest {
        main_ref: "origin/main".to_string(),
        topic_ref: "topic".to_string(),
        main_sha: ObjectId::new([1u8; 20]),
        topic_sha: ObjectId::new([2u8; 20]),
        remotes: vec!["https://github.com/example/repo.git".to_string()],
        pack: pack.clone(),
    };

    let mut stream = test_client(&url).deconflict("merge", req).await.unwrap();
    assert!(stream.next().await.unwrap().is_ok());
    assert!(stream.next().await.is_none());

    let request = server.await.unwrap();
    let text = String::from_utf8_lossy(&request);
    assert!(text.starts_with("POST /cli/merge/ HTTP/1.1"));
    assert!(text.contains("main-ref: origin/main"));
    assert!(text.contains("topic-ref: topic"));
    assert!(text.contains(&format!("main-sha: {}", "01".repeat(20))));
    assert!(text.contains(&format!("pack-size: {}", pack.len())));
    assert!(text.contains("remote: https://github.com/example/repo.git"));
    assert!(request.ends_with(b"PACKDATA"));
}

#[tokio::test]
async fn test_early_termination_after_exit_directive() {
    let body = multipart_body(&[
        ("application/json", br#"{"exit_code": 2, "stderr": "conflict\n"}"#),
        ("application/octet-stream", b"never read"),
    ]);
    let (url, _server) = serve(ok_response(&body)).await;

    let mut stream = test_client(&url).root().await.unwrap();
    match stream.next().await.unwrap().unwrap() {
        ResponseMessage::Control(ctl) => {
            assert_eq!(ctl.exit_code, 2);
            assert_eq!(ctl.stderr, "conflict\n");
        }
        other => panic!("expected control message, got: {:?}", other),
    }
    // Caller stops pulling here; dropping the stream releases the connection.
    drop(stream);
}
