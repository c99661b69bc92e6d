//! CV pipeline trace dashboard.
//!
//! Queries Stage 1 frame detections and Stage 2 video classifications from a
//! Databricks SQL warehouse, joins them, and serves a small web UI that
//! renders each event's frames (as an animated GIF) and video.

pub mod cleanup;
pub mod config;
pub mod connection;
pub mod error;
pub mod inference;
pub mod logging;
pub mod mapping;
pub mod media;
pub mod query_service;
pub mod secrets;
pub mod storage;
pub mod transcode;
pub mod ui;
pub mod warehouse;

pub use error::{DashboardError, Result};
