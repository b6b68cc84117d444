use directup_upload::{BoxFuture, ObjectTransport, TransferRequest, UploadError};
use futures_util::TryStreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{BackendError, request_error};

/// Read size for streamed request bodies: 256 KiB.
const STREAM_CHUNK_SIZE: usize = 256 * 1024;

/// Streams files to presigned object-store URLs with a single PUT.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }

    /// Uses a caller-configured client (proxies, custom roots).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ObjectTransport for HttpTransport {
    fn put_object<'a>(
        &'a self,
        request: &'a TransferRequest,
        progress: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            let file = tokio::fs::File::open(&request.path).await?;

            let mut sent: u64 = 0;
            let body = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE).inspect_ok(
                move |chunk| {
                    sent += chunk.len() as u64;
                    let _ = progress.send(sent);
                },
            );

            let send = self
                .http
                .put(&request.upload_url)
                .header(CONTENT_TYPE, &request.content_type)
                .header(CONTENT_LENGTH, request.size_bytes)
                .header(AUTHORIZATION, &request.auth_token)
                .header(request.hash_header, &request.hash_value)
                .body(reqwest::Body::wrap_stream(body))
                .send();

            let resp = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                resp = send => resp.map_err(request_error)?,
            };

            let status = resp.status();
            if status.is_success() {
                debug!(
                    url = %redact(&request.upload_url),
                    status = status.as_u16(),
                    "object stored"
                );
                return Ok(());
            }
            let body = resp.text().await.unwrap_or_default();
            Err(UploadError::from_status(status.as_u16(), &body))
        })
    }
}

/// Strips the query string, which carries the signature.
fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use directup_protocol::ErrorClass;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accepts one PUT, reads its full body, answers with `status`.
    ///
    /// Sends back the request head and the number of body bytes received.
    async fn mock_store(
        status: u16,
        body: &'static str,
    ) -> (String, oneshot::Receiver<(String, usize)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut data = Vec::new();
            let mut buf = vec![0u8; 64 * 1024];
            let mut head_end = None;
            let mut length = 0usize;
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
                if head_end.is_none() {
                    if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                        head_end = Some(end);
                        let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
                        length = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse().ok())
                            .unwrap_or(0);
                    }
                }
                if let Some(end) = head_end {
                    if data.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            let end = head_end.unwrap_or(data.len());
            let head = String::from_utf8_lossy(&data[..end]).into_owned();
            let received = data.len().saturating_sub(end + 4);
            let _ = tx.send((head, received));

            let resp = format!(
                "HTTP/1.1 {status} Mock\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
        });

        (format!("http://127.0.0.1:{port}/bucket/clip.mp4?X-Sig=abc"), rx)
    }

    fn request_for(dir: &TempDir, url: String, size: usize) -> TransferRequest {
        let path: PathBuf = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![9u8; size]).unwrap();
        TransferRequest {
            path,
            upload_url: url,
            auth_token: "upload-token".into(),
            content_type: "video/mp4".into(),
            size_bytes: size as u64,
            hash_header: "Content-MD5",
            hash_value: "abc123==".into(),
        }
    }

    #[tokio::test]
    async fn streams_file_with_headers_and_progress() {
        let dir = TempDir::new().unwrap();
        let (url, captured) = mock_store(200, "").await;
        let request = request_for(&dir, url, 600 * 1024);
        let transport = HttpTransport::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport
            .put_object(&request, tx, CancellationToken::new())
            .await
            .unwrap();

        let (head, received) = captured.await.unwrap();
        let lower = head.to_lowercase();
        assert!(head.starts_with("PUT /bucket/clip.mp4?X-Sig=abc "));
        assert!(lower.contains("content-type: video/mp4"));
        assert!(lower.contains("content-length: 614400"));
        assert!(lower.contains("content-md5: abc123=="));
        assert!(lower.contains("authorization: upload-token"));
        assert_eq!(received, 600 * 1024);

        let mut last = 0;
        while let Ok(sent) = rx.try_recv() {
            assert!(sent > last);
            last = sent;
        }
        assert_eq!(last, 600 * 1024);
    }

    #[tokio::test]
    async fn error_statuses_are_classified() {
        let dir = TempDir::new().unwrap();
        let transport = HttpTransport::new().unwrap();

        let cases = [
            (403, "<Code>AccessDenied</Code>", ErrorClass::NonRetryable),
            (403, "<Message>Request has expired</Message>", ErrorClass::AuthRefresh),
            (413, "", ErrorClass::NonRetryable),
            (503, "", ErrorClass::Retryable),
        ];
        for (status, body, expected) in cases {
            let (url, _captured) = mock_store(status, body).await;
            let request = request_for(&dir, url, 1024);
            let (tx, _rx) = mpsc::unbounded_channel();
            let err = transport
                .put_object(&request, tx, CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.class(), expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn cancel_stops_waiting_for_the_store() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold the connection without ever answering.
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(stream);
            }
        });

        let dir = TempDir::new().unwrap();
        let request = request_for(&dir, format!("http://127.0.0.1:{port}/obj"), 1024);
        let transport = HttpTransport::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.put_object(&request, tx, cancel),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let transport = HttpTransport::new().unwrap();
        let request = TransferRequest {
            path: PathBuf::from("/nonexistent/clip.mp4"),
            upload_url: "http://127.0.0.1:9/obj".into(),
            auth_token: "t".into(),
            content_type: "video/mp4".into(),
            size_bytes: 1,
            hash_header: "Content-MD5",
            hash_value: "x".into(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport
            .put_object(&request, tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Io(_)));
        assert_eq!(err.class(), ErrorClass::NonRetryable);
    }

    #[test]
    fn redact_strips_signature() {
        assert_eq!(redact("https://b.example/k.mp4?X-Sig=1"), "https://b.example/k.mp4");
        assert_eq!(redact("https://b.example/k.mp4"), "https://b.example/k.mp4");
    }
}
