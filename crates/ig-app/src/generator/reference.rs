use std::path::PathBuf;

use tracing::{info, warn};
use walkdir::WalkDir;

use ig_core::config::ReferenceImagesConfig;
use ig_core::element::{Element, ElementCategory, RepeatPolicy};
use ig_core::error::{GenError, Result};
use ig_core::pool::{PoolManager, PoolPolicy};

/// Image files under the reference directory, sorted by path.
pub fn scan_references(config: &ReferenceImagesConfig) -> Vec<PathBuf> {
    if !config.directory.is_dir() {
        warn!(dir = %config.directory.display(), "Reference image directory not found");
        return Vec::new();
    }

    let wanted: Vec<String> = config.extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
    let mut found: Vec<PathBuf> = WalkDir::new(&config.directory)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| wanted.contains(&e.to_ascii_lowercase()))
        })
        .collect();
    found.sort();
    found
}

/// Register the reference directory as the `Reference` pool. Returns the
/// number of images; zero means generation runs prompt-only.
pub fn register_references(config: &ReferenceImagesConfig, pools: &PoolManager) -> Result<usize> {
    let paths = scan_references(config);
    if paths.is_empty() {
        warn!(dir = %config.directory.display(), "No reference images, ControlNet disabled");
        return Ok(0);
    }

    let elements: Vec<Element> = paths
        .iter()
        .map(|path| {
            let id = path
                .strip_prefix(&config.directory)
                .unwrap_or(path.as_path())
                .to_string_lossy()
                .replace('\\', "/");
            Element::new(id, path.to_string_lossy())
        })
        .collect();
    let count = elements.len();

    pools.register_pool(
        ElementCategory::Reference,
        elements,
        vec![1.0; count],
        PoolPolicy {
            repeat: RepeatPolicy::NoRepeatPerBatch,
            on_exhausted: config.on_exhausted,
        },
    )?;
    info!(count, dir = %config.directory.display(), "Registered reference images");
    Ok(count)
}

/// Read a reference picked from the pool.
pub async fn read_reference(element: &Element) -> Result<Vec<u8>> {
    tokio::fs::read(&element.text)
        .await
        .map_err(|e| GenError::ReferenceImage(format!("{}: {e}", element.text)))
}
