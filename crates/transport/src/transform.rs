//! Resize/convert directives and their JSON request bodies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target formats that cannot carry transparency. Converting only to these
/// requires a background colour to flatten onto.
const OPAQUE_TYPES: &[&str] = &["image/jpeg", "image/jpg"];

const SUPPORTED_TYPES: &[&str] = &[
    "image/avif",
    "image/webp",
    "image/png",
    "image/jpeg",
    "image/jpg",
    "*/*",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMethod {
    /// Proportional; exactly one of width/height.
    Scale,
    /// Fit within width x height, keeping aspect ratio.
    Fit,
    /// Crop to exactly width x height.
    Cover,
    /// Smart crop for thumbnails.
    Thumb,
}

impl ResizeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResizeMethod::Scale => "scale",
            ResizeMethod::Fit => "fit",
            ResizeMethod::Cover => "cover",
            ResizeMethod::Thumb => "thumb",
        }
    }
}

impl fmt::Display for ResizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResizeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scale" => Ok(ResizeMethod::Scale),
            "fit" => Ok(ResizeMethod::Fit),
            "cover" => Ok(ResizeMethod::Cover),
            "thumb" => Ok(ResizeMethod::Thumb),
            other => Err(format!(
                "unknown resize method `{other}` (expected scale, fit, cover or thumb)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResizeSpec {
    pub method: ResizeMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ResizeSpec {
    pub fn new(method: ResizeMethod, width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            method,
            width,
            height,
        }
    }

    /// `scale` takes exactly one dimension; the others need both.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == Some(0) || self.height == Some(0) {
            return Err("resize dimensions must be greater than 0".into());
        }
        match (self.method, self.width, self.height) {
            (ResizeMethod::Scale, Some(_), None) | (ResizeMethod::Scale, None, Some(_)) => Ok(()),
            (ResizeMethod::Scale, _, _) => {
                Err("scale requires exactly one of width or height".into())
            }
            (_, Some(_), Some(_)) => Ok(()),
            (method, _, _) => Err(format!("{method} requires both width and height")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertSpec {
    /// Candidate MIME types; the service picks the smallest result.
    pub types: Vec<String>,
    /// Colour used to flatten transparency (e.g. "#ffffff", "white").
    pub background: Option<String>,
}

impl ConvertSpec {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            background: None,
        }
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = Some(background.into());
        self
    }

    /// True when every target is opaque, so transparency must be flattened.
    pub fn needs_background(&self) -> bool {
        !self.types.is_empty()
            && self
                .types
                .iter()
                .all(|t| OPAQUE_TYPES.contains(&t.to_ascii_lowercase().as_str()))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.types.is_empty() {
            return Err("convert requires at least one target type".into());
        }
        for t in &self.types {
            if !SUPPORTED_TYPES.contains(&t.to_ascii_lowercase().as_str()) {
                return Err(format!("unsupported conversion target `{t}`"));
            }
        }
        if self.needs_background() && self.background.is_none() {
            return Err(format!(
                "converting to {} requires a background colour to flatten transparency",
                self.types.join(", ")
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct ConvertBody {
    #[serde(rename = "type")]
    types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct BackgroundBody {
    background: String,
}

/// JSON body posted to a result handle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    resize: Option<ResizeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    convert: Option<ConvertBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transform: Option<BackgroundBody>,
}

impl TransformRequest {
    pub fn resize(spec: &ResizeSpec) -> Self {
        Self {
            resize: Some(spec.clone()),
            ..Self::default()
        }
    }

    pub fn convert(spec: &ConvertSpec) -> Self {
        Self {
            resize: None,
            convert: Some(ConvertBody {
                types: spec.types.clone(),
            }),
            transform: spec.background.as_ref().map(|bg| BackgroundBody {
                background: bg.clone(),
            }),
        }
    }

    /// Resize and convert in a single request.
    pub fn combined(resize: &ResizeSpec, convert: &ConvertSpec) -> Self {
        Self {
            resize: Some(resize.clone()),
            ..Self::convert(convert)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resize.is_none() && self.convert.is_none()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
