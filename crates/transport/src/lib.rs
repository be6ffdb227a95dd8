//! Transport layer for the remote image compression API
//!
//! Defines the `Transport` trait that decouples the request pipeline from the
//! HTTP stack. `HttpTransport` is the reqwest-backed implementation; tests swap
//! in scripted transports that return canned responses.
//!
//! Layers:
//! - `Transport::send` performs one authenticated request, streaming the upload
//!   in fixed-size chunks and reassembling the download, reporting byte
//!   progress on both sides.
//! - `ApiClient` knows the endpoint layout (`/shrink`, result handles) and the
//!   JSON bodies for resize/convert.
//! - `ApiError` is the structured failure handed to the error classifier.

pub mod client;
pub mod error;
pub mod http;
pub mod transform;

pub use client::{ApiClient, Payload, ShrinkOutput};
pub use error::{ApiError, NetworkErrorKind};
pub use http::{DEFAULT_CHUNK_SIZE, DEFAULT_USAGE_HEADER, HttpTransport};
pub use transform::{ConvertSpec, ResizeMethod, ResizeSpec, TransformRequest};

use bytes::Bytes;
use common::Secret;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by `Transport` methods (keeps the trait dyn-compatible).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Byte progress callback: `(bytes_done, total_bytes)`.
///
/// `total_bytes` is `None` when the peer did not announce a length.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    /// Raw image bytes, uploaded in chunks.
    Binary(Bytes),
    Json(serde_json::Value),
}

/// One outbound request, without credentials.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub body: RequestBody,
}

/// A successful (2xx) response with its body fully buffered.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub status: u16,
    pub location: Option<String>,
    pub content_type: Option<String>,
    /// Server-reported usage counter for the credential, if the header was present.
    pub usage: Option<u64>,
    pub body: Bytes,
}

/// Progress callbacks for one request.
#[derive(Clone, Default)]
pub struct TransferProgress {
    pub upload: Option<ProgressFn>,
    pub download: Option<ProgressFn>,
}

impl TransferProgress {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn upload(callback: ProgressFn) -> Self {
        Self {
            upload: Some(callback),
            download: None,
        }
    }

    pub fn download(callback: ProgressFn) -> Self {
        Self {
            upload: None,
            download: Some(callback),
        }
    }
}

impl fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferProgress")
            .field("upload", &self.upload.is_some())
            .field("download", &self.download.is_some())
            .finish()
    }
}

/// Abstraction over the wire.
///
/// Implementations must:
/// - authenticate with the given secret (never log it)
/// - return `Ok` only for 2xx responses, converting everything else into
///   `ApiError::Status`
/// - read the usage counter from the response headers, never guess it
/// - resolve to `ApiError::Cancelled` promptly once `token` is cancelled
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        secret: &'a Secret<String>,
        request: ApiRequest,
        progress: TransferProgress,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>>;
}
