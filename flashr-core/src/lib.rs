//! The core, UI-agnostic library for the `flashr` image flasher.
//!
//! `flashr-core` takes an image from a URL or a local file to a verified copy
//! on removable media. It is meant to be driven by any front-end, a CLI
//! (like `flashr`) or a GUI, and does not print or prompt on its own.
//!
//! The library is structured into several key modules:
//! - [`engine`]: The command surface. Start here.
//! - [`device`] and [`platform`]: Block device discovery and the
//!   conservative system-disk policy.
//! - [`auth`]: Per-platform permission to write a raw device.
//! - [`download`], [`decompress`] and [`mod@write`]: The pipeline stages.
//! - [`cache`]: The size-capped LRU image cache the stages share.
//! - [`operation`], [`progress`] and [`monitor`]: The single operation slot,
//!   pollable progress and hot-plug detection.
//! - [`config`] and [`error`]: Configuration and the error taxonomy.
//!
//! Long-running commands run on a worker thread and return an
//! [`engine::OperationHandle`]. Instead of taking progress callbacks they
//! update shared state, which the front-end polls at whatever rate suits it.

pub mod auth;
pub mod cache;
pub mod config;
pub mod decompress;
pub mod device;
pub mod download;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod operation;
pub mod os_options;
pub mod platform;
pub mod progress;
pub mod write;

pub use config::Config;
pub use device::{BlockDevice, BusType};
pub use engine::{Canceller, Engine, EngineBuilder, OperationHandle};
pub use error::{Error, ErrorKind, ErrorReport, Result};
pub use operation::Stage;
pub use progress::{DownloadProgress, FlashProgress};
