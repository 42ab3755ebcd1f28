//! In-memory sandbox for tests: a map-backed filesystem and canned
//! command results.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use globset::Glob;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{
    ExecOptions, ExecResult, FileInfo, GlobOptions, Sandbox, SandboxFs, SandboxKind,
};

#[derive(Default)]
struct MockFsState {
    files: HashMap<String, String>,
}

#[derive(Default)]
struct MockFs {
    state: Mutex<MockFsState>,
}

fn canonical_key(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}

#[async_trait]
impl SandboxFs for MockFs {
    fn resolve(&self, path: &str) -> PathBuf {
        PathBuf::from(canonical_key(path))
    }

    fn is_inside(&self, path: &str) -> bool {
        !Path::new(path).is_absolute()
    }

    async fn read(&self, path: &str) -> Result<String> {
        self.state
            .lock()
            .expect("mock fs lock poisoned")
            .files
            .get(&canonical_key(path))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file: {path}")))
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        self.state
            .lock()
            .expect("mock fs lock poisoned")
            .files
            .insert(canonical_key(path), content.to_string());
        Ok(())
    }

    fn temp(&self, name: &str) -> PathBuf {
        PathBuf::from(format!(".tmp/{}-{name}", Uuid::new_v4()))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let state = self.state.lock().expect("mock fs lock poisoned");
        let content = state
            .files
            .get(&canonical_key(path))
            .ok_or_else(|| Error::NotFound(format!("file: {path}")))?;
        Ok(FileInfo {
            path: canonical_key(path),
            size: content.len() as u64,
            modified: Utc::now(),
            is_dir: false,
        })
    }

    async fn glob(&self, pattern: &str, _opts: GlobOptions) -> Result<Vec<String>> {
        let matcher = Glob::new(pattern)
            .map_err(|e| Error::Input(format!("invalid glob pattern '{pattern}': {e}")))?
            .compile_matcher();
        let state = self.state.lock().expect("mock fs lock poisoned");
        let mut matches: Vec<String> = state
            .files
            .keys()
            .filter(|key| matcher.is_match(key.as_str()))
            .cloned()
            .collect();
        matches.sort();
        Ok(matches)
    }
}

/// Sandbox with no host side effects.
pub struct MockSandbox {
    fs: Arc<MockFs>,
    exec_results: Mutex<HashMap<String, ExecResult>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        MockSandbox {
            fs: Arc::new(MockFs::default()),
            exec_results: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a canned result for an exact command string.
    pub fn stub_exec(&self, cmd: impl Into<String>, result: ExecResult) {
        self.exec_results
            .lock()
            .expect("mock exec lock poisoned")
            .insert(cmd.into(), result);
    }
}

impl Default for MockSandbox {
    fn default() -> Self {
        MockSandbox::new()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Mock
    }

    fn work_dir(&self) -> String {
        ".".to_string()
    }

    fn fs(&self) -> Arc<dyn SandboxFs> {
        self.fs.clone()
    }

    async fn exec(&self, cmd: &str, _opts: ExecOptions) -> Result<ExecResult> {
        let stubbed = self
            .exec_results
            .lock()
            .expect("mock exec lock poisoned")
            .get(cmd)
            .cloned();
        Ok(stubbed.unwrap_or(ExecResult {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}
