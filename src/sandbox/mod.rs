//! Sandbox contract: the exec + filesystem capability surface builtin
//! tools run against.
//!
//! Cloud and remote backends live outside this crate; the local and mock
//! implementations here cover development and tests.

pub mod local;
pub mod mock;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};

pub use local::LocalSandbox;
pub use mock::MockSandbox;

/// Sandbox backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    Local,
    Mock,
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::Local => write!(f, "local"),
            SandboxKind::Mock => write!(f, "mock"),
        }
    }
}

/// Options for one command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub work_dir: Option<String>,
    pub env: HashMap<String, String>,
}

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// File metadata returned by [`SandboxFs::stat`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

/// Options for [`SandboxFs::glob`].
#[derive(Debug, Clone, Default)]
pub struct GlobOptions {
    pub ignore: Vec<String>,
    /// Match dotfiles as well.
    pub include_hidden: bool,
    /// Return absolute instead of work-dir-relative paths.
    pub absolute: bool,
}

/// A filesystem change observed by a watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub path: String,
    pub mtime: DateTime<Utc>,
}

/// Callback invoked for every observed file change.
pub type FileChangeListener = Arc<dyn Fn(FileChangeEvent) + Send + Sync>;

/// Filesystem capability of a sandbox.
#[async_trait]
pub trait SandboxFs: Send + Sync {
    /// Resolves a possibly-relative path against the work dir.
    fn resolve(&self, path: &str) -> PathBuf;

    /// True when the path stays inside the sandbox boundary.
    fn is_inside(&self, path: &str) -> bool;

    async fn read(&self, path: &str) -> Result<String>;

    /// Writes the file, creating parent directories as needed.
    async fn write(&self, path: &str, content: &str) -> Result<()>;

    /// A scratch path derived from `name`; nothing is created.
    fn temp(&self, name: &str) -> PathBuf;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    async fn glob(&self, pattern: &str, opts: GlobOptions) -> Result<Vec<String>>;
}

/// One isolated execution environment, owned by a single agent.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> SandboxKind;

    fn work_dir(&self) -> String;

    fn fs(&self) -> Arc<dyn SandboxFs>;

    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecResult>;

    /// Starts watching `paths`, invoking `listener` on changes. Returns a
    /// watch id for [`unwatch`](Self::unwatch). Default: unsupported.
    fn watch(&self, _paths: &[String], _listener: FileChangeListener) -> Result<String> {
        Err(Error::Input(format!(
            "sandbox kind '{}' does not support file watching",
            self.kind()
        )))
    }

    fn unwatch(&self, _watch_id: &str) -> Result<()> {
        Ok(())
    }

    async fn dispose(&self) -> Result<()>;
}

/// Builds sandboxes from configuration.
#[derive(Debug, Default)]
pub struct SandboxFactory;

impl SandboxFactory {
    pub fn new() -> Self {
        SandboxFactory
    }

    pub fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        match config.kind {
            SandboxKind::Local => Ok(Arc::new(LocalSandbox::new(config)?)),
            SandboxKind::Mock => Ok(Arc::new(MockSandbox::new())),
        }
    }
}
