//! reqwest-backed transport
//!
//! Uploads are split into fixed-size slices and fed to reqwest as a stream, so
//! the upload callback fires once per slice as the body is consumed. Downloads
//! are read with `bytes_stream()` and reassembled into one buffer; the pipeline
//! needs the complete payload to compute sizes.
//!
//! No timeout is imposed here. Timeouts belong to the `reqwest::Client` the
//! embedding application builds.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use common::Secret;
use futures_util::{Stream, StreamExt};
use reqwest::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    ApiError, ApiRequest, ApiResponse, BoxFuture, Method, ProgressFn, RequestBody,
    TransferProgress, Transport,
};

/// Upload slice size.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Response header carrying the per-key usage counter.
pub const DEFAULT_USAGE_HEADER: &str = "compression-count";

/// Cap on the download buffer preallocation, whatever Content-Length claims.
const MAX_PREALLOC: u64 = 32 * 1024 * 1024;

/// Basic-auth user name; the API key is the password.
const AUTH_USER: &str = "api";

pub struct HttpTransport {
    client: reqwest::Client,
    chunk_size: usize,
    usage_header: HeaderName,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
            usage_header: HeaderName::from_static(DEFAULT_USAGE_HEADER),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_usage_header(mut self, name: &str) -> Result<Self, ApiError> {
        self.usage_header = HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| ApiError::InvalidRequest(format!("invalid usage header `{name}`: {e}")))?;
        Ok(self)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn execute(
        &self,
        secret: &Secret<String>,
        request: ApiRequest,
        progress: TransferProgress,
    ) -> Result<ApiResponse, ApiError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder.header(AUTHORIZATION, basic_auth(secret)?);

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Binary(bytes) => {
                let len = bytes.len();
                let stream = chunked_upload(bytes, self.chunk_size, progress.upload.clone());
                builder
                    .header(CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(stream))
            }
            RequestBody::Json(value) => builder.json(&value),
        };

        trace!(method = ?request.method, url = %request.url, "sending request");
        let response = builder.send().await?;

        let status = response.status();
        let usage = read_usage(response.headers(), &self.usage_header);
        let location = header_string(response.headers(), &LOCATION);
        let content_type = header_string(response.headers(), &CONTENT_TYPE);

        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let err = ApiError::from_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                &body,
            );
            debug!(status = status.as_u16(), error = %err, "request rejected");
            return Err(err);
        }

        let content_length = response.content_length();
        let body = collect_chunks(
            response.bytes_stream(),
            content_length,
            progress.download.as_ref(),
        )
        .await?;

        debug!(
            status = status.as_u16(),
            bytes = body.len(),
            usage = ?usage,
            "request completed"
        );

        Ok(ApiResponse {
            status: status.as_u16(),
            location,
            content_type,
            usage,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        secret: &'a Secret<String>,
        request: ApiRequest,
        progress: TransferProgress,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(ApiError::Cancelled),
                result = self.execute(secret, request, progress) => result,
            }
        })
    }
}

/// `Authorization: Basic base64("api:<key>")`, marked sensitive.
pub fn basic_auth(secret: &Secret<String>) -> Result<HeaderValue, ApiError> {
    let encoded = BASE64.encode(format!("{AUTH_USER}:{}", secret.expose()));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|_| ApiError::InvalidRequest("API key is not a valid header value".into()))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Split `body` into `chunk_size` slices, reporting `(sent, Some(total))` as each
/// slice is handed to the transport.
///
/// An empty body reports `(0, Some(0))` once and yields nothing.
pub fn chunked_upload(
    body: Bytes,
    chunk_size: usize,
    progress: Option<ProgressFn>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    let total = body.len() as u64;
    let chunk_size = chunk_size.max(1);

    let mut chunks = Vec::with_capacity(body.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk_size).min(body.len());
        chunks.push(body.slice(offset..end));
        offset = end;
    }

    if total == 0
        && let Some(cb) = &progress
    {
        cb(0, Some(0));
    }

    let mut sent = 0u64;
    futures_util::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        if let Some(cb) = &progress {
            cb(sent, Some(total));
        }
        Ok(chunk)
    })
}

/// Drain a byte stream into one buffer, reporting `(received, content_length)`
/// after every chunk.
pub async fn collect_chunks<S, E>(
    stream: S,
    content_length: Option<u64>,
    progress: Option<&ProgressFn>,
) -> Result<Bytes, ApiError>
where
    S: Stream<Item = Result<Bytes, E>>,
    ApiError: From<E>,
{
    let mut stream = std::pin::pin!(stream);
    let capacity = content_length.map(|n| n.min(MAX_PREALLOC)).unwrap_or(0) as usize;
    let mut buffer = BytesMut::with_capacity(capacity);
    let mut received = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        received += chunk.len() as u64;
        buffer.extend_from_slice(&chunk);
        if let Some(cb) = progress {
            cb(received, content_length);
        }
    }

    Ok(buffer.freeze())
}

/// Parse the usage counter header. Missing or malformed values are `None`.
pub fn read_usage(headers: &HeaderMap, name: &HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    const DOWNLOAD_SIZE: usize = 300_000;

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<(u64, Option<u64>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressFn = Arc::new(move |done, total| sink.lock().unwrap().push((done, total)));
        (cb, seen)
    }

    fn expected_auth(key: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("api:{key}")))
    }

    /// Start a mock compression API on an ephemeral port.
    async fn start_mock_api() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("http://{addr}");
        let location = format!("{base}/output/abc123");

        let app = Router::new()
            .route(
                "/shrink",
                post(move |headers: axum::http::HeaderMap, body: axum::body::Bytes| {
                    let location = location.clone();
                    async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("");
                        if auth != expected_auth("good-key") {
                            let mut h = axum::http::HeaderMap::new();
                            h.insert("compression-count", "12".parse().unwrap());
                            return (
                                StatusCode::UNAUTHORIZED,
                                h,
                                r#"{"error":"Unauthorized","message":"Credentials are invalid."}"#
                                    .to_string(),
                            )
                                .into_response();
                        }
                        let mut h = axum::http::HeaderMap::new();
                        h.insert("location", location.parse().unwrap());
                        h.insert("compression-count", "7".parse().unwrap());
                        h.insert("content-type", "application/json".parse().unwrap());
                        let json = serde_json::json!({
                            "input": {"size": body.len(), "type": "image/png"},
                            "output": {"size": body.len() / 2, "type": "image/png"}
                        });
                        (StatusCode::CREATED, h, json.to_string()).into_response()
                    }
                }),
            )
            .route(
                "/output/abc123",
                get(|| async {
                    let mut h = axum::http::HeaderMap::new();
                    h.insert("compression-count", "7".parse().unwrap());
                    h.insert("content-type", "image/png".parse().unwrap());
                    (StatusCode::OK, h, vec![0xABu8; DOWNLOAD_SIZE])
                })
                .post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            );

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (base, handle)
    }

    #[tokio::test]
    async fn chunked_upload_splits_and_reports_each_slice() {
        let (cb, seen) = recorder();
        let body = Bytes::from(vec![1u8; 200_000]);
        let stream = chunked_upload(body, DEFAULT_CHUNK_SIZE, Some(cb));

        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![65_536, 65_536, 65_536, 3_392]);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (65_536, Some(200_000)),
                (131_072, Some(200_000)),
                (196_608, Some(200_000)),
                (200_000, Some(200_000)),
            ]
        );
    }

    #[tokio::test]
    async fn chunked_upload_empty_body_reports_zero_once() {
        let (cb, seen) = recorder();
        let stream = chunked_upload(Bytes::new(), 16, Some(cb));
        let chunks: Vec<Result<Bytes, std::io::Error>> = stream.collect().await;
        assert!(chunks.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![(0, Some(0))]);
    }

    #[tokio::test]
    async fn collect_chunks_reassembles_and_reports() {
        let (cb, seen) = recorder();
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defg")),
            Ok(Bytes::from_static(b"h")),
        ];
        let body = collect_chunks(futures_util::stream::iter(parts), Some(8), Some(&cb))
            .await
            .unwrap();
        assert_eq!(&body[..], b"abcdefgh");
        assert_eq!(*seen.lock().unwrap(), vec![(3, Some(8)), (7, Some(8)), (8, Some(8))]);
    }

    #[tokio::test]
    async fn collect_chunks_propagates_stream_errors() {
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "stalled")),
        ];
        let err = collect_chunks(futures_util::stream::iter(parts), None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Network {
                kind: crate::NetworkErrorKind::Timeout,
                ..
            }
        ));
    }

    #[test]
    fn read_usage_parses_and_ignores_garbage() {
        let name = HeaderName::from_static(DEFAULT_USAGE_HEADER);
        let mut headers = HeaderMap::new();
        assert_eq!(read_usage(&headers, &name), None);
        headers.insert("compression-count", HeaderValue::from_static(" 42 "));
        assert_eq!(read_usage(&headers, &name), Some(42));
        headers.insert("compression-count", HeaderValue::from_static("lots"));
        assert_eq!(read_usage(&headers, &name), None);
    }

    #[test]
    fn basic_auth_uses_api_user_and_is_sensitive() {
        let value = basic_auth(&Secret::from("k3y")).unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value.to_str().unwrap(), expected_auth("k3y"));
    }

    #[test]
    fn basic_auth_encodes_awkward_keys() {
        assert!(basic_auth(&Secret::from("key with spaces\n")).is_ok());
    }

    #[test]
    fn custom_usage_header_is_normalised() {
        let transport = HttpTransport::new(reqwest::Client::new())
            .with_usage_header("X-Usage-Count")
            .unwrap();
        assert_eq!(transport.usage_header.as_str(), "x-usage-count");
        assert!(
            HttpTransport::new(reqwest::Client::new())
                .with_usage_header("bad header")
                .is_err()
        );
    }

    #[tokio::test]
    async fn upload_streams_body_and_reads_location_and_usage() {
        let (base, _server) = start_mock_api().await;
        let transport = HttpTransport::new(reqwest::Client::new());
        let (cb, seen) = recorder();

        let response = transport
            .send(
                &Secret::from("good-key"),
                ApiRequest {
                    method: Method::Post,
                    url: format!("{base}/shrink"),
                    body: RequestBody::Binary(Bytes::from(vec![9u8; 150_000])),
                },
                TransferProgress::upload(cb),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.usage, Some(7));
        assert_eq!(
            response.location.as_deref(),
            Some(format!("{base}/output/abc123").as_str())
        );
        let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(json["input"]["size"], 150_000);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3, "150000 bytes in 64 KiB slices: {seen:?}");
        assert_eq!(seen.last(), Some(&(150_000, Some(150_000))));
    }

    #[tokio::test]
    async fn download_reports_progress_up_to_content_length() {
        let (base, _server) = start_mock_api().await;
        let transport = HttpTransport::new(reqwest::Client::new());
        let (cb, seen) = recorder();

        let response = transport
            .send(
                &Secret::from("good-key"),
                ApiRequest {
                    method: Method::Get,
                    url: format!("{base}/output/abc123"),
                    body: RequestBody::Empty,
                },
                TransferProgress::download(cb),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.body.len(), DOWNLOAD_SIZE);
        assert_eq!(response.content_type.as_deref(), Some("image/png"));
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0), "monotonic: {seen:?}");
        assert_eq!(
            seen.last(),
            Some(&(DOWNLOAD_SIZE as u64, Some(DOWNLOAD_SIZE as u64)))
        );
    }

    #[tokio::test]
    async fn rejected_request_becomes_status_error() {
        let (base, _server) = start_mock_api().await;
        let transport = HttpTransport::new(reqwest::Client::new());

        let err = transport
            .send(
                &Secret::from("wrong-key"),
                ApiRequest {
                    method: Method::Post,
                    url: format!("{base}/shrink"),
                    body: RequestBody::Binary(Bytes::from_static(b"png")),
                },
                TransferProgress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            ApiError::Status {
                status,
                kind,
                message,
                ..
            } => {
                assert_eq!(status, 401);
                assert_eq!(kind.as_deref(), Some("Unauthorized"));
                assert_eq!(message, "Credentials are invalid.");
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_keeps_raw_body() {
        let (base, _server) = start_mock_api().await;
        let transport = HttpTransport::new(reqwest::Client::new());

        let err = transport
            .send(
                &Secret::from("good-key"),
                ApiRequest {
                    method: Method::Post,
                    url: format!("{base}/output/abc123"),
                    body: RequestBody::Json(serde_json::json!({"resize": {"method": "fit"}})),
                },
                TransferProgress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.message(), "boom");
    }

    #[tokio::test]
    async fn dead_endpoint_is_connection_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(reqwest::Client::new());
        let err = transport
            .send(
                &Secret::from("good-key"),
                ApiRequest {
                    method: Method::Get,
                    url: format!("http://{addr}/output/x"),
                    body: RequestBody::Empty,
                },
                TransferProgress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ApiError::Network {
                    kind: crate::NetworkErrorKind::ConnectionRefused,
                    ..
                }
            ),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn unresolvable_host_is_not_retryable() {
        let transport = HttpTransport::new(reqwest::Client::new());
        let err = transport
            .send(
                &Secret::from("good-key"),
                ApiRequest {
                    method: Method::Get,
                    url: "http://no-such-host.invalid/output/x".to_string(),
                    body: RequestBody::Empty,
                },
                TransferProgress::none(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ApiError::Network {
                    kind: crate::NetworkErrorKind::Other,
                    ..
                }
            ),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let (base, _server) = start_mock_api().await;
        let transport = HttpTransport::new(reqwest::Client::new());
        let token = CancellationToken::new();
        token.cancel();

        let err = transport
            .send(
                &Secret::from("good-key"),
                ApiRequest {
                    method: Method::Get,
                    url: format!("{base}/output/abc123"),
                    body: RequestBody::Empty,
                },
                TransferProgress::none(),
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Cancelled));
    }
}
