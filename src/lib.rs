pub mod backpressure;
pub mod chunk_size;
pub mod config;
pub mod encoding;
pub mod error;
pub mod ffmpeg;
pub mod ledger;
pub mod muxer;
pub mod orchestrator;
pub mod producer;
pub mod progress;
pub mod reclaim;
