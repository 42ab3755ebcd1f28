//! Local-process sandbox: commands run under `sh -c` in the work
//! directory, file access goes through the host filesystem with an
//! optional path boundary.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{Error, Result};

use super::{
    ExecOptions, ExecResult, FileChangeEvent, FileChangeListener, FileInfo, GlobOptions, Sandbox,
    SandboxFs, SandboxKind,
};

/// How often the polling watcher compares mtimes.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Removes `.`/`..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

struct LocalFs {
    root: PathBuf,
    enforce_boundary: bool,
    allow_paths: Vec<PathBuf>,
}

impl LocalFs {
    fn check_boundary(&self, path: &str) -> Result<PathBuf> {
        let resolved = self.resolve(path);
        if self.enforce_boundary && !self.is_inside(path) {
            return Err(Error::Permission(format!(
                "path escapes the sandbox: {}",
                resolved.display()
            )));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl SandboxFs for LocalFs {
    fn resolve(&self, path: &str) -> PathBuf {
        let requested = Path::new(path);
        if requested.is_absolute() {
            normalize(requested)
        } else {
            normalize(&self.root.join(requested))
        }
    }

    fn is_inside(&self, path: &str) -> bool {
        let resolved = self.resolve(path);
        resolved.starts_with(&self.root)
            || self
                .allow_paths
                .iter()
                .any(|allowed| resolved.starts_with(allowed))
    }

    async fn read(&self, path: &str) -> Result<String> {
        let resolved = self.check_boundary(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| Error::Upstream(format!("read {}: {e}", resolved.display())))
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let resolved = self.check_boundary(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Upstream(format!("mkdir {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| Error::Upstream(format!("write {}: {e}", resolved.display())))
    }

    fn temp(&self, name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("strand-{}-{name}", Uuid::new_v4()))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let resolved = self.check_boundary(path)?;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| Error::NotFound(format!("stat {}: {e}", resolved.display())))?;
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(FileInfo {
            path: resolved.to_string_lossy().into_owned(),
            size: meta.len(),
            modified,
            is_dir: meta.is_dir(),
        })
    }

    async fn glob(&self, pattern: &str, opts: GlobOptions) -> Result<Vec<String>> {
        let matcher = Glob::new(pattern)
            .map_err(|e| Error::Input(format!("invalid glob pattern '{pattern}': {e}")))?
            .compile_matcher();
        let ignore = build_globset(&opts.ignore)?;

        let mut matches = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let relative = match path.strip_prefix(&self.root) {
                    Ok(relative) => relative.to_path_buf(),
                    Err(_) => continue,
                };
                let name = entry.file_name();
                let hidden = name.to_string_lossy().starts_with('.');
                if hidden && !opts.include_hidden {
                    continue;
                }
                if let Some(ignore) = &ignore {
                    if ignore.is_match(&relative) {
                        continue;
                    }
                }
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    stack.push(path);
                } else if matcher.is_match(&relative) {
                    let rendered = if opts.absolute {
                        path.to_string_lossy().into_owned()
                    } else {
                        relative.to_string_lossy().into_owned()
                    };
                    matches.push(rendered);
                }
            }
        }
        matches.sort();
        Ok(matches)
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| Error::Input(format!("invalid glob pattern '{pattern}': {e}")))?,
        );
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::Input(format!("invalid glob set: {e}")))
}

/// Sandbox backed by the host machine.
pub struct LocalSandbox {
    root: PathBuf,
    fs: Arc<LocalFs>,
    watches: Mutex<HashMap<String, CancellationToken>>,
}

impl LocalSandbox {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let work_dir = PathBuf::from(&config.work_dir);
        std::fs::create_dir_all(&work_dir)
            .map_err(|e| Error::Upstream(format!("create work dir: {e}")))?;
        let root = work_dir
            .canonicalize()
            .map_err(|e| Error::Upstream(format!("resolve work dir: {e}")))?;

        let allow_paths = config
            .allow_paths
            .iter()
            .map(|p| normalize(Path::new(p)))
            .collect();

        Ok(LocalSandbox {
            fs: Arc::new(LocalFs {
                root: root.clone(),
                enforce_boundary: config.enforce_boundary,
                allow_paths,
            }),
            root,
            watches: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Local
    }

    fn work_dir(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn fs(&self) -> Arc<dyn SandboxFs> {
        self.fs.clone()
    }

    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecResult> {
        let cwd = opts
            .work_dir
            .as_deref()
            .map(|dir| self.fs.resolve(dir))
            .unwrap_or_else(|| self.root.clone());

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(&cwd)
            // Ask well-behaved tools for plain, uncolored output.
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .envs(&opts.env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| Error::Upstream(format!("spawn '{cmd}': {e}")))?;

        let output = child.wait_with_output();
        let output = match opts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, output).await.map_err(|_| {
                Error::Timeout(format!(
                    "command timed out after {}ms: {cmd}",
                    timeout.as_millis()
                ))
            })?,
            None => output.await,
        }
        .map_err(|e| Error::Upstream(format!("exec '{cmd}': {e}")))?;

        Ok(ExecResult {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn watch(&self, paths: &[String], listener: FileChangeListener) -> Result<String> {
        let watch_id = format!("watch-{}", Uuid::new_v4());
        let token = CancellationToken::new();
        let resolved: Vec<PathBuf> = paths.iter().map(|p| self.fs.resolve(p)).collect();

        let task_token = token.clone();
        tokio::spawn(async move {
            let mut seen: HashMap<PathBuf, DateTime<Utc>> = HashMap::new();
            let mut ticker = tokio::time::interval(WATCH_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for path in &resolved {
                    let Ok(meta) = tokio::fs::metadata(path).await else {
                        continue;
                    };
                    let Ok(modified) = meta.modified() else {
                        continue;
                    };
                    let mtime = DateTime::<Utc>::from(modified);
                    let changed = match seen.get(path) {
                        Some(previous) => *previous < mtime,
                        None => false,
                    };
                    seen.insert(path.clone(), mtime);
                    if changed {
                        listener(FileChangeEvent {
                            path: path.to_string_lossy().into_owned(),
                            mtime,
                        });
                    }
                }
            }
        });

        self.watches
            .lock()
            .expect("watch lock poisoned")
            .insert(watch_id.clone(), token);
        debug!(watch_id = %watch_id, "file watch started");
        Ok(watch_id)
    }

    fn unwatch(&self, watch_id: &str) -> Result<()> {
        let token = self
            .watches
            .lock()
            .expect("watch lock poisoned")
            .remove(watch_id)
            .ok_or_else(|| Error::NotFound(format!("watch: {watch_id}")))?;
        token.cancel();
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let mut watches = self.watches.lock().expect("watch lock poisoned");
        for (_, token) in watches.drain() {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox(temp: &TempDir) -> LocalSandbox {
        LocalSandbox::new(&SandboxConfig::local(
            temp.path().to_string_lossy().into_owned(),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);
        let fs = sandbox.fs();

        fs.write("nested/dir/a.txt", "hello").await.unwrap();
        assert_eq!(fs.read("nested/dir/a.txt").await.unwrap(), "hello");

        let info = fs.stat("nested/dir/a.txt").await.unwrap();
        assert_eq!(info.size, 5);
        assert!(!info.is_dir);
    }

    #[tokio::test]
    async fn exec_captures_output_and_code() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);

        let result = sandbox
            .exec("echo out; echo err >&2; exit 3", ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.code, 3);
        assert!(result.stdout.contains("out"));
        assert!(result.stderr.contains("err"));
    }

    #[tokio::test]
    async fn exec_runs_in_work_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "x").unwrap();
        let sandbox = sandbox(&temp);

        let result = sandbox.exec("ls", ExecOptions::default()).await.unwrap();
        assert!(result.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn exec_times_out() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);

        let err = sandbox
            .exec(
                "sleep 5",
                ExecOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn boundary_blocks_escapes_when_enforced() {
        let temp = TempDir::new().unwrap();
        let mut config = SandboxConfig::local(temp.path().to_string_lossy().into_owned());
        config.enforce_boundary = true;
        let sandbox = LocalSandbox::new(&config).unwrap();
        let fs = sandbox.fs();

        let err = fs.read("../../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), "permission");
        assert!(!fs.is_inside("/etc/passwd"));
        assert!(fs.is_inside("inner.txt"));
    }

    #[tokio::test]
    async fn glob_matches_relative_paths() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);
        let fs = sandbox.fs();
        fs.write("src/a.rs", "").await.unwrap();
        fs.write("src/deep/b.rs", "").await.unwrap();
        fs.write("src/c.txt", "").await.unwrap();

        let matches = fs.glob("src/**/*.rs", GlobOptions::default()).await.unwrap();
        assert_eq!(matches, vec!["src/a.rs", "src/deep/b.rs"]);
    }

    #[tokio::test]
    async fn watch_reports_mtime_changes() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);
        sandbox.fs().write("watched.txt", "v1").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let listener: FileChangeListener = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let watch_id = sandbox
            .watch(&["watched.txt".to_string()], listener)
            .unwrap();

        // Ensure the poller has the baseline, then bump the mtime.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let path = temp.path().join("watched.txt");
        let old = std::time::SystemTime::now() + Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("change not observed")
            .unwrap();
        assert!(event.path.ends_with("watched.txt"));

        sandbox.unwatch(&watch_id).unwrap();
        assert_eq!(
            sandbox.unwatch(&watch_id).unwrap_err().kind(),
            "not_found"
        );
    }
}
