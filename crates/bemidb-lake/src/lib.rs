//! # BemiDB Lake
//!
//! Apache Iceberg table format on top of an [`object_store`] backend:
//! a metadata document model, a reader that enumerates the catalog and
//! resolves current snapshots, and a writer that streams row batches into
//! Parquet data files and commits snapshots atomically.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;

pub mod batch;
pub mod metadata;
pub mod reader;
pub mod writer;

pub use reader::{LakeReader, TableSnapshot};
pub use writer::LakeWriter;

/// Subdirectory of the storage root holding lake table data.
const LAKE_DIR: &str = "iceberg";

/// Object store rooted at `<storage_path>/iceberg` on the local
/// filesystem. Remote backends plug in through the same trait.
pub fn local_lake_store(storage_path: &Path) -> Result<Arc<dyn ObjectStore>> {
    let root = storage_path.join(LAKE_DIR);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create lake root {}", root.display()))?;
    let store = LocalFileSystem::new_with_prefix(&root)
        .with_context(|| format!("open lake root {}", root.display()))?;
    Ok(Arc::new(store))
}

/// Absolute filesystem path of a lake-relative location, for engines that
/// read data files directly.
pub fn lake_file_path(storage_path: &Path, relative: &str) -> std::path::PathBuf {
    storage_path.join(LAKE_DIR).join(relative)
}
