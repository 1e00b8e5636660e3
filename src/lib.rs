pub mod api;
pub mod archive;
pub mod batch;
pub mod config;
pub mod download;
mod error;
pub mod ffmpeg;
pub mod job;
pub mod joblog;
pub mod paths;
pub mod process;
pub mod progress;
pub mod store;
pub mod tools;
pub mod upload;
pub mod ytdlp;

pub use api::Engine;
pub use error::{EngineError, Result};
