//! Types shared across the imgshrink crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
