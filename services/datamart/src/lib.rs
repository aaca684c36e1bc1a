//! Shared layer for the monitoria datamart services.
//!
//! Responsibilities:
//! - Database gateway with automatic reconnect-and-retry (db)
//! - Daily run gating and outcome recording against hist_bases (history)
//! - Failure serialization for the history table (diagnostic)
//! - HTML-table spreadsheet parsing for the .xls exports (sheet)
//! - Period-scoped discovery of ficha files (files)

pub mod db;
pub mod diagnostic;
pub mod files;
pub mod history;
pub mod sheet;

pub use db::{Database, Value};
pub use files::{list_ficha_files, FichaFile, Period};
pub use history::{check_run_permit, record_run, RunPermit, RunRecord, RETRY_LIMIT};
pub use sheet::{Column, Sheet};
