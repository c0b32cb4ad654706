//! TestContext - temporary data directories for nodes under test
//!
//! Each context owns a unique temporary directory that is removed when the
//! context is dropped. Node fixtures place primary and replica data
//! directories underneath it.

use std::any::Any;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Owns a temporary directory and any resources registered for cleanup
///
/// # Example
///
/// ```rust,no_run
/// use nrtsearch_core::testing::TestContext;
///
/// let ctx = TestContext::new();
/// let primary_dir = ctx.subdir("primary");
/// // everything under ctx.path() is removed when ctx is dropped
/// ```
pub struct TestContext {
    temp_dir: TempDir,
    resources: Vec<Box<dyn Any>>,
}

impl TestContext {
    /// Create a context with a fresh, existing temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");

        Self {
            temp_dir,
            resources: Vec::new(),
        }
    }

    /// Root of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path of a named subdirectory (not created)
    pub fn subdir(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Keep `resource` alive until the context is dropped
    pub fn register<T: Any>(&mut self, resource: T) {
        self.resources.push(Box::new(resource));
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        // resources go first, they may hold files inside the directory
        while let Some(resource) = self.resources.pop() {
            drop(resource);
        }
    }
}
