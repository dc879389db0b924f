//! # Dropwatch Common Library
//!
//! Shared code for the Dropwatch monitor processes including:
//! - Error types
//! - Configuration loading and project routing
//! - WhatsApp message store reader (SQLite mirror)
//! - Drop-number extraction
//! - Dedup / watermark state files and health reporting
//! - QA checklist model and missing-step computation
//! - Google Sheets mirror client and row schema
//! - Installation registry (Postgres)
//! - WhatsApp bridge send client and notifier

pub mod config;
pub mod error;
pub mod extract;
pub mod health;
pub mod notify;
pub mod qa;
pub mod registry;
pub mod sheet;
pub mod state;
pub mod store;
pub mod timing;

pub use error::{Error, Result};
