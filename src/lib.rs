#![forbid(unsafe_code)]

//! Public entry point for the tubepipe crate.
//!
//! The library holds everything behind `POST /download`: request validation,
//! format resolution, the yt-dlp metadata probe, and the relay that streams
//! yt-dlp's stdout into the HTTP response. The binary only wires it to a
//! listener.

pub mod classify;
pub mod config;
pub mod error;
pub mod format;
pub mod probe;
pub mod process;
pub mod rate_limit;
pub mod relay;
pub mod request;
pub mod sanitize;
pub mod server;
pub mod static_files;

#[cfg(test)]
pub(crate) mod test_support;
