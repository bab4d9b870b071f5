//! Core crate for the framelapse render pipeline and HTTP API.

pub mod artifacts;
pub mod config;
pub mod encoder;
pub mod immich;
pub mod jobs;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod progress;
pub mod server;
