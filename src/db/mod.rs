//! Database module: upload history and persisted upload-limit state.
//!
//! - `model`: row types returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules import from `auto_uploader::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::UploadRow;
