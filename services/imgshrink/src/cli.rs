//! Command-line arguments

use clap::Parser;
use pipeline::{CompressionTask, Composition};
use std::path::PathBuf;
use transport::{ConvertSpec, ResizeMethod, ResizeSpec};

/// Compress an image through the metered API, rotating across API keys.
#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (defaults to $IMGSHRINK_CONFIG, then ./imgshrink.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Resize as METHOD:WxH; METHOD is scale, fit, cover or thumb.
    /// scale takes a single dimension (800x or x600)
    #[arg(long, value_name = "METHOD:WxH", value_parser = parse_resize)]
    pub resize: Option<ResizeSpec>,

    /// Convert to one of these types, e.g. `webp,avif` or `image/png`
    #[arg(long, value_name = "TYPE", value_delimiter = ',', value_parser = normalize_type)]
    pub convert: Option<Vec<String>>,

    /// Colour used to flatten transparency when converting
    #[arg(long, value_name = "COLOR", requires = "convert")]
    pub background: Option<String>,

    /// Resize first, then re-upload and convert in a separate request
    #[arg(long)]
    pub sequential: bool,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    pub metrics: bool,

    /// File path, `-` for stdin, or an http(s) URL
    pub input: String,

    /// Destination file
    pub output: PathBuf,
}

/// `fit:800x600`, `scale:800x`, `scale:x600`
fn parse_resize(spec: &str) -> Result<ResizeSpec, String> {
    let (method, dims) = spec
        .split_once(':')
        .ok_or_else(|| format!("invalid resize `{spec}`, expected METHOD:WxH"))?;
    let method: ResizeMethod = method.parse()?;
    let (w, h) = dims
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid resize dimensions `{dims}`, expected WxH"))?;
    let dim = |s: &str| -> Result<Option<u32>, String> {
        if s.is_empty() {
            return Ok(None);
        }
        s.parse::<u32>()
            .map(Some)
            .map_err(|_| format!("invalid resize dimension `{s}`"))
    };
    let resize = ResizeSpec::new(method, dim(w)?, dim(h)?);
    resize.validate()?;
    Ok(resize)
}

/// `webp` → `image/webp`; full MIME types pass through.
fn normalize_type(t: &str) -> Result<String, String> {
    let t = t.trim();
    if t.is_empty() {
        return Err("empty conversion type".to_string());
    }
    Ok(if t.contains('/') {
        t.to_ascii_lowercase()
    } else {
        format!("image/{}", t.to_ascii_lowercase())
    })
}

impl Args {
    pub fn task(&self) -> CompressionTask {
        let task = if self.input == "-" {
            CompressionTask::from_reader(tokio::io::stdin())
        } else if self.input.starts_with("http://") || self.input.starts_with("https://") {
            CompressionTask::from_url(self.input.clone())
        } else {
            CompressionTask::from_file(&self.input)
        };

        let task = match &self.resize {
            Some(resize) => task.with_resize(resize.clone()),
            None => task,
        };
        let task = match &self.convert {
            Some(types) => {
                let mut spec = ConvertSpec::new(types.iter().cloned());
                if let Some(bg) = &self.background {
                    spec = spec.with_background(bg.clone());
                }
                task.with_convert(spec)
            }
            None => task,
        };
        if self.sequential {
            task.with_composition(Composition::Sequential)
        } else {
            task
        }
    }
}
