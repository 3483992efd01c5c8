//! NekoDrive Manifest
//!
//! Transactional index mapping logical files to their ordered shard lists,
//! backed by sled. Also holds upload sessions, the shard deletion queue and
//! the circular snapshot slots.
//!
//! # Usage
//!
//! ```ignore
//! use nekodrive_metadata::ManifestStore;
//!
//! let manifest = ManifestStore::open("./nekodrive_data/manifest")?;
//! let files = manifest.list_files(None)?;
//! ```

pub mod export;
pub mod models;
pub mod store;

pub use export::{ManifestContents, ManifestExport, EXPORT_FORMAT, EXPORT_VERSION};
pub use models::*;
pub use store::{ManifestError, ManifestStore};
