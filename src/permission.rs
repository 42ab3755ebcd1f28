//! Permission policy: list/rule/mode evaluation, approval routing, and
//! pre/post hooks around tool execution.
//!
//! Evaluation order is fixed: deny-list, allow-list, ask-list, per-tool
//! rule, default mode — first match wins.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ToolCallRecord, ToolCallSnapshot};

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
    Ask,
}

/// Policy applied when no list or rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Permit everything.
    Allow,
    /// Ask for everything not decided by a list.
    Approval,
    /// Permit by default, overridable by lists and rules.
    Auto,
}

/// Per-tool rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub decision: PermissionDecision,
    pub reason: String,
}

/// Counters updated by every check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionStats {
    pub total_checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub approval: u64,
    pub hook_errors: u64,
}

/// Asynchronous approver consulted by [`PermissionManager::request_approval`].
pub type ApprovalFn = Arc<
    dyn Fn(ToolCallSnapshot) -> BoxFuture<'static, Result<(PermissionDecision, String)>>
        + Send
        + Sync,
>;

/// Hook run before execution; may return a modified call.
pub type PreToolHook =
    Arc<dyn Fn(ToolCallRecord) -> BoxFuture<'static, Result<ToolCallRecord>> + Send + Sync>;

/// Hook run after execution, observing the outcome.
pub type PostToolHook = Arc<
    dyn Fn(ToolCallSnapshot, Option<Value>, Option<String>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// A pre/post hook pair; either side is optional.
#[derive(Clone, Default)]
pub struct PermissionHook {
    pub pre_tool_use: Option<PreToolHook>,
    pub post_tool_use: Option<PostToolHook>,
}

/// Constructor options.
#[derive(Clone, Default)]
pub struct PermissionOptions {
    pub default_mode: Option<PermissionMode>,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub ask_list: Vec<String>,
    pub approval: Option<ApprovalFn>,
}

struct Inner {
    default_mode: PermissionMode,
    allow_list: HashSet<String>,
    deny_list: HashSet<String>,
    ask_list: HashSet<String>,
    rules: HashMap<String, PermissionRule>,
    approval: Option<ApprovalFn>,
    hooks: Vec<PermissionHook>,
    stats: PermissionStats,
}

/// Gate between the engine and tool execution.
pub struct PermissionManager {
    inner: RwLock<Inner>,
}

impl PermissionManager {
    pub fn new(options: PermissionOptions) -> Self {
        PermissionManager {
            inner: RwLock::new(Inner {
                default_mode: options.default_mode.unwrap_or(PermissionMode::Auto),
                allow_list: options.allow_list.into_iter().collect(),
                deny_list: options.deny_list.into_iter().collect(),
                ask_list: options.ask_list.into_iter().collect(),
                rules: HashMap::new(),
                approval: options.approval,
                hooks: Vec::new(),
                stats: PermissionStats::default(),
            }),
        }
    }

    /// Evaluates the policy for one call. First match wins:
    /// deny > allow > ask > rule > default mode.
    pub fn check(&self, call: &ToolCallSnapshot) -> (PermissionDecision, String) {
        let mut inner = self.inner.write().expect("permission lock poisoned");
        inner.stats.total_checks += 1;

        let name = call.name.as_str();
        let (decision, reason) = if inner.deny_list.contains(name) {
            (PermissionDecision::Deny, "tool is in deny list".to_string())
        } else if inner.allow_list.contains(name) {
            (PermissionDecision::Allow, "tool is in allow list".to_string())
        } else if inner.ask_list.contains(name) {
            (PermissionDecision::Ask, "tool requires approval".to_string())
        } else if let Some(rule) = inner.rules.get(name) {
            (rule.decision, rule.reason.clone())
        } else {
            match inner.default_mode {
                PermissionMode::Allow => {
                    (PermissionDecision::Allow, "default mode: allow".to_string())
                }
                PermissionMode::Approval => (
                    PermissionDecision::Ask,
                    "default mode: approval".to_string(),
                ),
                PermissionMode::Auto => (
                    PermissionDecision::Allow,
                    "default mode: auto (allow)".to_string(),
                ),
            }
        };

        match decision {
            PermissionDecision::Allow => inner.stats.allowed += 1,
            PermissionDecision::Deny => inner.stats.denied += 1,
            PermissionDecision::Ask => inner.stats.approval += 1,
        }
        debug!(tool = name, ?decision, reason = %reason, "permission check");
        (decision, reason)
    }

    /// Consults the configured approver. Without one, the call is denied.
    pub async fn request_approval(
        &self,
        call: &ToolCallSnapshot,
    ) -> (PermissionDecision, String) {
        let approval = self
            .inner
            .read()
            .expect("permission lock poisoned")
            .approval
            .clone();
        let Some(approval) = approval else {
            return (
                PermissionDecision::Deny,
                "no approval function configured".to_string(),
            );
        };
        match approval(call.clone()).await {
            Ok((decision, reason)) => (decision, reason),
            Err(e) => (PermissionDecision::Deny, format!("approval error: {e}")),
        }
    }

    /// The configured approver, if any.
    pub fn approver(&self) -> Option<ApprovalFn> {
        self.inner
            .read()
            .expect("permission lock poisoned")
            .approval
            .clone()
    }

    /// Runs pre-hooks in registration order, threading the possibly
    /// modified call through. The first failing hook aborts.
    pub async fn run_pre_hooks(&self, call: ToolCallRecord) -> Result<ToolCallRecord> {
        let hooks: Vec<PreToolHook> = {
            let inner = self.inner.read().expect("permission lock poisoned");
            inner
                .hooks
                .iter()
                .filter_map(|h| h.pre_tool_use.clone())
                .collect()
        };

        let mut current = call;
        for hook in hooks {
            match hook(current.clone()).await {
                Ok(modified) => current = modified,
                Err(e) => {
                    self.inner
                        .write()
                        .expect("permission lock poisoned")
                        .stats
                        .hook_errors += 1;
                    return Err(Error::Permission(format!("pre-hook error: {e}")));
                }
            }
        }
        Ok(current)
    }

    /// Runs post-hooks. Failures are counted and returned, but callers
    /// treat them as observations only.
    pub async fn run_post_hooks(
        &self,
        call: &ToolCallSnapshot,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let hooks: Vec<PostToolHook> = {
            let inner = self.inner.read().expect("permission lock poisoned");
            inner
                .hooks
                .iter()
                .filter_map(|h| h.post_tool_use.clone())
                .collect()
        };

        for hook in hooks {
            if let Err(e) = hook(call.clone(), result.clone(), error.clone()).await {
                self.inner
                    .write()
                    .expect("permission lock poisoned")
                    .stats
                    .hook_errors += 1;
                return Err(Error::Permission(format!("post-hook error: {e}")));
            }
        }
        Ok(())
    }

    pub fn add_hook(&self, hook: PermissionHook) {
        self.inner
            .write()
            .expect("permission lock poisoned")
            .hooks
            .push(hook);
    }

    pub fn set_rule(
        &self,
        tool_name: impl Into<String>,
        decision: PermissionDecision,
        reason: impl Into<String>,
    ) {
        self.inner
            .write()
            .expect("permission lock poisoned")
            .rules
            .insert(
                tool_name.into(),
                PermissionRule {
                    decision,
                    reason: reason.into(),
                },
            );
    }

    pub fn remove_rule(&self, tool_name: &str) {
        self.inner
            .write()
            .expect("permission lock poisoned")
            .rules
            .remove(tool_name);
    }

    /// Adds the tool to the allow-list, removing it from the other lists.
    pub fn add_to_allow_list(&self, tool_name: impl Into<String>) {
        let name = tool_name.into();
        let mut inner = self.inner.write().expect("permission lock poisoned");
        inner.deny_list.remove(&name);
        inner.ask_list.remove(&name);
        inner.allow_list.insert(name);
    }

    /// Adds the tool to the deny-list, removing it from the other lists.
    pub fn add_to_deny_list(&self, tool_name: impl Into<String>) {
        let name = tool_name.into();
        let mut inner = self.inner.write().expect("permission lock poisoned");
        inner.allow_list.remove(&name);
        inner.ask_list.remove(&name);
        inner.deny_list.insert(name);
    }

    /// Adds the tool to the ask-list, removing it from the other lists.
    pub fn add_to_ask_list(&self, tool_name: impl Into<String>) {
        let name = tool_name.into();
        let mut inner = self.inner.write().expect("permission lock poisoned");
        inner.allow_list.remove(&name);
        inner.deny_list.remove(&name);
        inner.ask_list.insert(name);
    }

    pub fn remove_from_lists(&self, tool_name: &str) {
        let mut inner = self.inner.write().expect("permission lock poisoned");
        inner.allow_list.remove(tool_name);
        inner.deny_list.remove(tool_name);
        inner.ask_list.remove(tool_name);
    }

    pub fn set_approval(&self, approval: ApprovalFn) {
        self.inner
            .write()
            .expect("permission lock poisoned")
            .approval = Some(approval);
    }

    pub fn set_default_mode(&self, mode: PermissionMode) {
        self.inner
            .write()
            .expect("permission lock poisoned")
            .default_mode = mode;
    }

    pub fn default_mode(&self) -> PermissionMode {
        self.inner
            .read()
            .expect("permission lock poisoned")
            .default_mode
    }

    pub fn stats(&self) -> PermissionStats {
        self.inner.read().expect("permission lock poisoned").stats
    }

    pub fn clear_stats(&self) {
        self.inner.write().expect("permission lock poisoned").stats = PermissionStats::default();
    }
}

impl Default for PermissionManager {
    fn default() -> Self {
        PermissionManager::new(PermissionOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;

    fn snapshot(name: &str) -> ToolCallSnapshot {
        ToolCallRecord::new("call-1", name, json!({})).snapshot()
    }

    #[test]
    fn deny_wins_over_everything() {
        let manager = PermissionManager::new(PermissionOptions {
            allow_list: vec!["bash_run".into()],
            deny_list: vec!["bash_run".into()],
            ask_list: vec!["bash_run".into()],
            ..Default::default()
        });
        manager.set_rule("bash_run", PermissionDecision::Allow, "rule");

        let (decision, reason) = manager.check(&snapshot("bash_run"));
        assert_eq!(decision, PermissionDecision::Deny);
        assert_eq!(reason, "tool is in deny list");
    }

    #[test]
    fn evaluation_order_allow_ask_rule_default() {
        let manager = PermissionManager::new(PermissionOptions {
            default_mode: Some(PermissionMode::Approval),
            allow_list: vec!["fs_read".into()],
            ask_list: vec!["bash_run".into()],
            ..Default::default()
        });
        manager.set_rule("fs_write", PermissionDecision::Deny, "writes are off");

        assert_eq!(
            manager.check(&snapshot("fs_read")).0,
            PermissionDecision::Allow
        );
        assert_eq!(
            manager.check(&snapshot("bash_run")).0,
            PermissionDecision::Ask
        );
        let (decision, reason) = manager.check(&snapshot("fs_write"));
        assert_eq!(decision, PermissionDecision::Deny);
        assert_eq!(reason, "writes are off");
        // Nothing matches: default mode decides.
        assert_eq!(
            manager.check(&snapshot("other")).0,
            PermissionDecision::Ask
        );
    }

    #[test]
    fn default_modes() {
        for (mode, expected) in [
            (PermissionMode::Allow, PermissionDecision::Allow),
            (PermissionMode::Approval, PermissionDecision::Ask),
            (PermissionMode::Auto, PermissionDecision::Allow),
        ] {
            let manager = PermissionManager::new(PermissionOptions {
                default_mode: Some(mode),
                ..Default::default()
            });
            assert_eq!(manager.check(&snapshot("anything")).0, expected);
        }
    }

    #[test]
    fn stats_track_decisions() {
        let manager = PermissionManager::new(PermissionOptions {
            deny_list: vec!["bad".into()],
            ask_list: vec!["risky".into()],
            ..Default::default()
        });
        manager.check(&snapshot("bad"));
        manager.check(&snapshot("risky"));
        manager.check(&snapshot("fine"));

        let stats = manager.stats();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.approval, 1);
        assert_eq!(stats.allowed, 1);

        manager.clear_stats();
        assert_eq!(manager.stats(), PermissionStats::default());
    }

    #[test]
    fn list_mutators_are_exclusive() {
        let manager = PermissionManager::default();
        manager.add_to_deny_list("bash_run");
        assert_eq!(
            manager.check(&snapshot("bash_run")).0,
            PermissionDecision::Deny
        );

        manager.add_to_allow_list("bash_run");
        assert_eq!(
            manager.check(&snapshot("bash_run")).0,
            PermissionDecision::Allow
        );

        manager.remove_from_lists("bash_run");
        assert_eq!(
            manager.check(&snapshot("bash_run")).0,
            PermissionDecision::Allow // auto default
        );
    }

    #[tokio::test]
    async fn approval_without_approver_denies() {
        let manager = PermissionManager::default();
        let (decision, reason) = manager.request_approval(&snapshot("bash_run")).await;
        assert_eq!(decision, PermissionDecision::Deny);
        assert!(reason.contains("no approval function"));
    }

    #[tokio::test]
    async fn approver_decides() {
        let manager = PermissionManager::default();
        manager.set_approval(Arc::new(|call| {
            async move {
                if call.name == "bash_run" {
                    Ok((PermissionDecision::Allow, "reviewed".to_string()))
                } else {
                    Ok((PermissionDecision::Deny, "unknown tool".to_string()))
                }
            }
            .boxed()
        }));

        let (decision, reason) = manager.request_approval(&snapshot("bash_run")).await;
        assert_eq!(decision, PermissionDecision::Allow);
        assert_eq!(reason, "reviewed");
    }

    #[tokio::test]
    async fn pre_hooks_thread_modifications_and_abort_on_error() {
        let manager = PermissionManager::default();
        manager.add_hook(PermissionHook {
            pre_tool_use: Some(Arc::new(|mut call| {
                async move {
                    call.input = json!({"path": "rewritten.txt"});
                    Ok(call)
                }
                .boxed()
            })),
            post_tool_use: None,
        });

        let record = ToolCallRecord::new("call-1", "fs_read", json!({"path": "a.txt"}));
        let modified = manager.run_pre_hooks(record).await.unwrap();
        assert_eq!(modified.input["path"], json!("rewritten.txt"));

        manager.add_hook(PermissionHook {
            pre_tool_use: Some(Arc::new(|_| {
                async move { Err(Error::Permission("nope".into())) }.boxed()
            })),
            post_tool_use: None,
        });
        let record = ToolCallRecord::new("call-2", "fs_read", json!({}));
        let err = manager.run_pre_hooks(record).await.unwrap_err();
        assert_eq!(err.kind(), "permission");
        assert_eq!(manager.stats().hook_errors, 1);
    }

    #[tokio::test]
    async fn post_hook_failures_are_counted() {
        let manager = PermissionManager::default();
        manager.add_hook(PermissionHook {
            pre_tool_use: None,
            post_tool_use: Some(Arc::new(|_, _, _| {
                async move { Err(Error::Internal("observer crashed".into())) }.boxed()
            })),
        });

        let result = manager
            .run_post_hooks(&snapshot("fs_read"), Some(json!({"ok": true})), None)
            .await;
        assert!(result.is_err());
        assert_eq!(manager.stats().hook_errors, 1);
    }
}
