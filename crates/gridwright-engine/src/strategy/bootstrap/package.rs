//! Worker package location cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::debug;

/// The transformation name of the worker package.
pub const WORKER_PACKAGE_TRANSFORMATION: &str = "gridwright::worker";

/// Caches the worker package location of each site.
///
/// Locations are resolved at most once per site even when many jobs of the
/// same site are enabled concurrently; later callers wait for the first
/// resolution to finish.
#[derive(Debug, Default)]
pub struct WorkerPackageCache {
    /// The per-site cells.
    sites: Mutex<HashMap<String, Arc<OnceLock<Option<String>>>>>,
}

impl WorkerPackageCache {
    /// Constructs an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the worker package location of a site, resolving it with
    /// `resolve` on first use.
    pub fn location(&self, site: &str, resolve: impl FnOnce() -> Option<String>) -> Option<String> {
        let cell = self
            .sites
            .lock()
            .entry(site.to_string())
            .or_default()
            .clone();

        cell.get_or_init(|| {
            let location = resolve();
            debug!(site, ?location, "resolved worker package location");
            location
        })
        .clone()
    }

    /// Gets the number of sites resolved so far.
    pub fn len(&self) -> usize {
        self.sites
            .lock()
            .values()
            .filter(|c| c.get().is_some())
            .count()
    }

    /// Determines if no site was resolved yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
