pub mod audio;
pub mod config;
pub mod container;
pub mod error;
pub mod meter;
pub mod recorder;
pub mod state;
pub mod transcode;
