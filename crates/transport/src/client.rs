//! Endpoint layout of the compression API on top of a `Transport`

use bytes::Bytes;
use common::Secret;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    ApiError, ApiRequest, ApiResponse, Method, ProgressFn, RequestBody, TransferProgress,
    TransformRequest, Transport,
};

/// Result of the primary `/shrink` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShrinkOutput {
    /// Absolute URL of the server-side result; target of later transforms.
    pub handle: String,
    pub usage: Option<u64>,
    pub input_size: Option<u64>,
    pub input_type: Option<String>,
    pub output_size: Option<u64>,
    pub output_type: Option<String>,
}

/// Binary result of a transform or download.
#[derive(Debug, Clone)]
pub struct Payload {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub usage: Option<u64>,
}

impl From<ApiResponse> for Payload {
    fn from(r: ApiResponse) -> Self {
        Self {
            body: r.body,
            content_type: r.content_type,
            usage: r.usage,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ShrinkBody {
    #[serde(default)]
    input: Option<ImageInfo>,
    #[serde(default)]
    output: Option<ImageInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageInfo {
    size: Option<u64>,
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    endpoint: String,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            transport,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Upload raw image bytes.
    pub async fn shrink_bytes(
        &self,
        secret: &Secret<String>,
        bytes: Bytes,
        progress: Option<ProgressFn>,
        token: &CancellationToken,
    ) -> Result<ShrinkOutput, ApiError> {
        let request = ApiRequest {
            method: Method::Post,
            url: self.shrink_url_path(),
            body: RequestBody::Binary(bytes),
        };
        let progress = TransferProgress {
            upload: progress,
            download: None,
        };
        let response = self.transport.send(secret, request, progress, token).await?;
        self.parse_shrink(response)
    }

    /// Ask the service to fetch and compress a remote image.
    pub async fn shrink_url(
        &self,
        secret: &Secret<String>,
        url: &str,
        token: &CancellationToken,
    ) -> Result<ShrinkOutput, ApiError> {
        let request = ApiRequest {
            method: Method::Post,
            url: self.shrink_url_path(),
            body: RequestBody::Json(serde_json::json!({ "source": { "url": url } })),
        };
        let response = self
            .transport
            .send(secret, request, TransferProgress::none(), token)
            .await?;
        self.parse_shrink(response)
    }

    /// Apply resize and/or convert directives to a result handle.
    pub async fn transform(
        &self,
        secret: &Secret<String>,
        handle: &str,
        directives: &TransformRequest,
        progress: Option<ProgressFn>,
        token: &CancellationToken,
    ) -> Result<Payload, ApiError> {
        if directives.is_empty() {
            return Err(ApiError::InvalidRequest(
                "transform request carries no directives".into(),
            ));
        }
        let request = ApiRequest {
            method: Method::Post,
            url: handle.to_string(),
            body: RequestBody::Json(directives.to_json()),
        };
        let progress = TransferProgress {
            upload: None,
            download: progress,
        };
        Ok(self
            .transport
            .send(secret, request, progress, token)
            .await?
            .into())
    }

    /// Fetch the compressed bytes behind a result handle.
    pub async fn download(
        &self,
        secret: &Secret<String>,
        handle: &str,
        progress: Option<ProgressFn>,
        token: &CancellationToken,
    ) -> Result<Payload, ApiError> {
        let request = ApiRequest {
            method: Method::Get,
            url: handle.to_string(),
            body: RequestBody::Empty,
        };
        let progress = TransferProgress {
            upload: None,
            download: progress,
        };
        Ok(self
            .transport
            .send(secret, request, progress, token)
            .await?
            .into())
    }

    fn shrink_url_path(&self) -> String {
        format!("{}/shrink", self.endpoint)
    }

    fn parse_shrink(&self, response: ApiResponse) -> Result<ShrinkOutput, ApiError> {
        let body: ShrinkBody = if response.body.is_empty() {
            ShrinkBody::default()
        } else {
            serde_json::from_slice(&response.body)
                .map_err(|e| ApiError::Protocol(format!("invalid shrink response: {e}")))?
        };
        let input = body.input.unwrap_or_default();
        let output = body.output.unwrap_or_default();

        let handle = response
            .location
            .as_deref()
            .map(|loc| self.resolve(loc))
            .or_else(|| output.url.clone())
            .ok_or_else(|| ApiError::Protocol("response carried no result location".into()))?;

        Ok(ShrinkOutput {
            handle,
            usage: response.usage,
            input_size: input.size,
            input_type: input.kind,
            output_size: output.size,
            output_type: output.kind,
        })
    }

    /// Relative `Location` values are joined onto the endpoint.
    fn resolve(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}/{}", self.endpoint, location.trim_start_matches('/'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use std::sync::Mutex;

    /// Replays canned responses and records what was sent.
    struct Scripted {
        responses: Mutex<Vec<Result<ApiResponse, ApiError>>>,
        sent: Mutex<Vec<ApiRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<ApiResponse, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for Scripted {
        fn send<'a>(
            &'a self,
            _secret: &'a Secret<String>,
            request: ApiRequest,
            _progress: TransferProgress,
            _token: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
            self.sent.lock().unwrap().push(request);
            let next = self.responses.lock().unwrap().remove(0);
            Box::pin(async move { next })
        }
    }

    fn shrink_response(location: Option<&str>, body: serde_json::Value) -> ApiResponse {
        ApiResponse {
            status: 201,
            location: location.map(str::to_owned),
            content_type: Some("application/json".into()),
            usage: Some(3),
            body: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test]
    async fn shrink_bytes_posts_binary_and_reads_sizes() {
        let transport = Scripted::new(vec![Ok(shrink_response(
            Some("https://api.example.com/output/xyz"),
            serde_json::json!({
                "input": {"size": 2048, "type": "image/png"},
                "output": {"size": 1024, "type": "image/png", "ratio": 0.5}
            }),
        ))]);
        let client = ApiClient::new(transport.clone(), "https://api.example.com/");

        let out = client
            .shrink_bytes(
                &Secret::from("k"),
                Bytes::from_static(b"png"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.handle, "https://api.example.com/output/xyz");
        assert_eq!(out.usage, Some(3));
        assert_eq!(out.input_size, Some(2048));
        assert_eq!(out.output_type.as_deref(), Some("image/png"));

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].url, "https://api.example.com/shrink");
        assert_eq!(sent[0].method, Method::Post);
        assert!(matches!(sent[0].body, RequestBody::Binary(_)));
    }

    #[tokio::test]
    async fn shrink_url_sends_source_json() {
        let transport = Scripted::new(vec![Ok(shrink_response(
            Some("/output/abc"),
            serde_json::json!({"output": {"size": 10}}),
        ))]);
        let client = ApiClient::new(transport.clone(), "https://api.example.com");

        let out = client
            .shrink_url(
                &Secret::from("k"),
                "https://cdn.example.com/cat.png",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.handle, "https://api.example.com/output/abc");
        assert_eq!(out.input_size, None);
        let sent = transport.sent.lock().unwrap();
        match &sent[0].body {
            RequestBody::Json(v) => {
                assert_eq!(v["source"]["url"], "https://cdn.example.com/cat.png")
            }
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_url_is_fallback_handle() {
        let transport = Scripted::new(vec![Ok(shrink_response(
            None,
            serde_json::json!({"output": {"url": "https://api.example.com/output/fallback"}}),
        ))]);
        let client = ApiClient::new(transport, "https://api.example.com");
        let out = client
            .shrink_bytes(&Secret::from("k"), Bytes::new(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.handle, "https://api.example.com/output/fallback");
    }

    #[tokio::test]
    async fn missing_handle_is_protocol_error() {
        let transport = Scripted::new(vec![Ok(shrink_response(None, serde_json::json!({})))]);
        let client = ApiClient::new(transport, "https://api.example.com");
        let err = client
            .shrink_bytes(&Secret::from("k"), Bytes::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn garbage_json_is_protocol_error() {
        let transport = Scripted::new(vec![Ok(ApiResponse {
            status: 201,
            location: Some("https://api.example.com/output/x".into()),
            body: Bytes::from_static(b"<html>"),
            ..ApiResponse::default()
        })]);
        let client = ApiClient::new(transport, "https://api.example.com");
        let err = client
            .shrink_bytes(&Secret::from("k"), Bytes::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Protocol(_)));
    }

    #[tokio::test]
    async fn transform_posts_directives_to_handle() {
        let transport = Scripted::new(vec![Ok(ApiResponse {
            status: 200,
            content_type: Some("image/webp".into()),
            usage: Some(4),
            body: Bytes::from_static(b"webp-bytes"),
            ..ApiResponse::default()
        })]);
        let client = ApiClient::new(transport.clone(), "https://api.example.com");
        let directives = TransformRequest::convert(&crate::ConvertSpec::new(["image/webp"]));

        let payload = client
            .transform(
                &Secret::from("k"),
                "https://api.example.com/output/xyz",
                &directives,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(&payload.body[..], b"webp-bytes");
        assert_eq!(payload.usage, Some(4));
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].url, "https://api.example.com/output/xyz");
        match &sent[0].body {
            RequestBody::Json(v) => assert_eq!(v["convert"]["type"][0], "image/webp"),
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_transform_is_rejected_locally() {
        let transport = Scripted::new(vec![]);
        let client = ApiClient::new(transport.clone(), "https://api.example.com");
        let err = client
            .transform(
                &Secret::from("k"),
                "https://api.example.com/output/xyz",
                &TransformRequest::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn download_is_a_get() {
        let transport = Scripted::new(vec![Ok(ApiResponse {
            status: 200,
            body: Bytes::from_static(b"img"),
            ..ApiResponse::default()
        })]);
        let client = ApiClient::new(transport.clone(), "https://api.example.com");
        let payload = client
            .download(
                &Secret::from("k"),
                "https://api.example.com/output/xyz",
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(payload.body.len(), 3);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].method, Method::Get);
        assert!(matches!(sent[0].body, RequestBody::Empty));
    }

    #[tokio::test]
    async fn transport_errors_pass_through() {
        let transport = Scripted::new(vec![Err(ApiError::from_status(
            429,
            "Too Many Requests",
            br#"{"error":"TooManyRequests","message":"Your monthly limit has been exceeded"}"#,
        ))]);
        let client = ApiClient::new(transport, "https://api.example.com");
        let err = client
            .shrink_bytes(&Secret::from("k"), Bytes::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
    }
}
