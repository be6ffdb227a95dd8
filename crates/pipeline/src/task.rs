//! Compression task model

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use transport::{ConvertSpec, ResizeSpec};

/// Where the image comes from.
pub enum Source {
    File(PathBuf),
    Buffer(Bytes),
    /// Read to the end before the first request.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    /// Fetched by the service; the size is unknown until it answers.
    Url(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Buffer,
    Stream,
    Url,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Buffer => "buffer",
            SourceKind::Stream => "stream",
            SourceKind::Url => "url",
        }
    }
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::File(_) => SourceKind::File,
            Source::Buffer(_) => SourceKind::Buffer,
            Source::Stream(_) => SourceKind::Stream,
            Source::Url(_) => SourceKind::Url,
        }
    }

    /// Short description for the start event; never the bytes themselves.
    pub fn describe(&self) -> String {
        match self {
            Source::File(path) => path.display().to_string(),
            Source::Buffer(b) => format!("<buffer {} bytes>", b.len()),
            Source::Stream(_) => "<stream>".to_string(),
            Source::Url(url) => url.clone(),
        }
    }

    /// Normalize the source into uploadable input.
    pub(crate) async fn load(self) -> std::io::Result<Input> {
        match self {
            Source::File(path) => Ok(Input::Bytes(Bytes::from(tokio::fs::read(&path).await?))),
            Source::Buffer(bytes) => Ok(Input::Bytes(bytes)),
            Source::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Input::Bytes(Bytes::from(buf)))
            }
            Source::Url(url) => Ok(Input::Url(url)),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File(path) => f.debug_tuple("File").field(path).finish(),
            Source::Buffer(b) => f.debug_tuple("Buffer").field(&b.len()).finish(),
            Source::Stream(_) => f.write_str("Stream(..)"),
            Source::Url(url) => f.debug_tuple("Url").field(url).finish(),
        }
    }
}

/// Prepared input for the upload stage.
#[derive(Debug, Clone)]
pub(crate) enum Input {
    Bytes(Bytes),
    Url(String),
}

impl Input {
    /// Local byte length, if the bytes are local.
    pub(crate) fn local_size(&self) -> Option<u64> {
        match self {
            Input::Bytes(b) => Some(b.len() as u64),
            Input::Url(_) => None,
        }
    }
}

/// How resize and convert are sent when both are requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Composition {
    /// One request carrying both directives.
    #[default]
    Combined,
    /// Resize, re-upload the result, then convert.
    Sequential,
}

#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub resize: Option<ResizeSpec>,
    pub convert: Option<ConvertSpec>,
    pub composition: Composition,
}

impl TaskOptions {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(resize) = &self.resize {
            resize.validate()?;
        }
        if let Some(convert) = &self.convert {
            convert.validate()?;
        }
        Ok(())
    }

    pub fn plan(&self) -> TransformPlan {
        match (&self.resize, &self.convert, self.composition) {
            (None, None, _) => TransformPlan::None,
            (Some(r), None, _) => TransformPlan::Resize(r.clone()),
            (None, Some(c), _) => TransformPlan::Convert(c.clone()),
            (Some(r), Some(c), Composition::Combined) => {
                TransformPlan::Combined(r.clone(), c.clone())
            }
            (Some(r), Some(c), Composition::Sequential) => {
                TransformPlan::Sequential(r.clone(), c.clone())
            }
        }
    }
}

/// Server-side work after the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformPlan {
    /// Compress only; download the result.
    None,
    Resize(ResizeSpec),
    Convert(ConvertSpec),
    Combined(ResizeSpec, ConvertSpec),
    Sequential(ResizeSpec, ConvertSpec),
}

impl TransformPlan {
    pub fn label(&self) -> &'static str {
        match self {
            TransformPlan::None => "compress",
            TransformPlan::Resize(_) => "resize",
            TransformPlan::Convert(_) => "convert",
            TransformPlan::Combined(..) => "resize_convert",
            TransformPlan::Sequential(..) => "resize_then_convert",
        }
    }
}

/// One image to compress.
#[derive(Debug)]
pub struct CompressionTask {
    pub source: Source,
    pub options: TaskOptions,
}

impl CompressionTask {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            options: TaskOptions::default(),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Source::File(path.into()))
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(Source::Buffer(bytes.into()))
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new(Source::Url(url.into()))
    }

    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::new(Source::Stream(Box::new(reader)))
    }

    pub fn with_resize(mut self, spec: ResizeSpec) -> Self {
        self.options.resize = Some(spec);
        self
    }

    pub fn with_convert(mut self, spec: ConvertSpec) -> Self {
        self.options.convert = Some(spec);
        self
    }

    pub fn with_composition(mut self, composition: Composition) -> Self {
        self.options.composition = composition;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::ResizeMethod;

    fn fit() -> ResizeSpec {
        ResizeSpec::new(ResizeMethod::Fit, Some(100), Some(100))
    }

    #[test]
    fn plan_follows_options() {
        let task = CompressionTask::from_bytes(vec![1u8]);
        assert_eq!(task.options.plan(), TransformPlan::None);

        let task = CompressionTask::from_bytes(vec![1u8]).with_resize(fit());
        assert_eq!(task.options.plan().label(), "resize");

        let task = CompressionTask::from_bytes(vec![1u8])
            .with_resize(fit())
            .with_convert(ConvertSpec::new(["image/webp"]));
        assert!(matches!(task.options.plan(), TransformPlan::Combined(..)));

        let task = task.with_composition(Composition::Sequential);
        assert!(matches!(task.options.plan(), TransformPlan::Sequential(..)));
    }

    #[test]
    fn jpeg_without_background_is_invalid() {
        let options = TaskOptions {
            convert: Some(ConvertSpec::new(["image/jpeg"])),
            ..TaskOptions::default()
        };
        assert!(options.validate().unwrap_err().contains("background"));
    }

    #[tokio::test]
    async fn stream_source_is_read_fully() {
        let reader = std::io::Cursor::new(vec![7u8; 1000]);
        let task = CompressionTask::from_reader(reader);
        assert_eq!(task.source.kind(), SourceKind::Stream);
        match task.source.load().await.unwrap() {
            Input::Bytes(b) => assert_eq!(b.len(), 1000),
            Input::Url(_) => panic!("expected bytes"),
        }
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let task = CompressionTask::from_file("/definitely/not/here.png");
        let err = task.source.load().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn url_source_has_no_local_size() {
        let input = Source::Url("https://example.com/a.png".into())
            .load()
            .await
            .unwrap();
        assert_eq!(input.local_size(), None);
    }

    #[test]
    fn debug_never_prints_buffer_contents() {
        let source = Source::Buffer(Bytes::from_static(b"secret-pixels"));
        assert_eq!(format!("{source:?}"), "Buffer(13)");
    }
}
