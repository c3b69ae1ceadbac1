//! exif-proxy - Stay-open process proxy for the exiftool metadata CLI.

pub mod config;
pub mod display;
pub mod metadata;
pub mod process;
pub mod protocol;
pub mod supervisor;
