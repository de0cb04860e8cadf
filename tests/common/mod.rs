//! Common test utilities for integration tests.

use reglock::{LockLibrary, RecordLockFile, RegLockConfig};
use std::path::PathBuf;
use tempfile::TempDir;

/// Test error type
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// Test environment: a library context with a unique shared-memory prefix,
/// plus one temp file to lock. The registry object is unlinked on drop so
/// test runs never collide or leak names.
pub struct TestEnv {
    pub lib: LockLibrary,
    pub path: PathBuf,
    prefix: String,
    _temp_dir: TempDir,
}

/// Install a tracing subscriber once per test binary, honoring
/// `RUST_LOG` so individual runs can turn on library tracing.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestEnv {
    pub fn new(tag: &str) -> Self {
        init_tracing();
        let prefix = format!("rlint{}{}", std::process::id(), tag);
        let mut config = RegLockConfig::default();
        config.shm.prefix = prefix.clone();

        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("data");
        std::fs::write(&path, vec![0u8; 128]).expect("failed to create test file");

        Self {
            lib: LockLibrary::with_config(config).expect("valid test config"),
            path,
            prefix,
            _temp_dir: temp_dir,
        }
    }

    /// Configuration for opening the same file from another library
    /// context (e.g. a second thread standing in for a second process).
    pub fn config(&self) -> RegLockConfig {
        let mut config = RegLockConfig::default();
        config.shm.prefix = self.prefix.clone();
        config
    }

    pub fn open(&mut self) -> RecordLockFile {
        let path = self.path.clone();
        self.lib
            .open(&path, libc::O_RDWR, 0)
            .expect("failed to open test file")
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = self.lib.unlink_registry(&self.path);
    }
}
