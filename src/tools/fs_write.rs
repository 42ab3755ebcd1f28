//! `fs_write`: write a file in the sandbox filesystem.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxFs};

use super::{Tool, ToolContext};

pub struct FsWriteTool;

#[derive(Debug, Deserialize)]
struct FsWriteInput {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &str {
        "fs_write"
    }

    fn description(&self) -> &str {
        "Write content to a file in the sandbox filesystem"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn prompt(&self) -> String {
        "## fs_write\n\n\
         Creates or overwrites a file inside the sandbox work directory. \
         Missing parent directories are created. Read the file first when \
         overwriting matters."
            .to_string()
    }

    async fn execute(&self, input: &Value, ctx: &ToolContext) -> Result<Value> {
        let input: FsWriteInput = serde_json::from_value(input.clone())
            .map_err(|e| Error::Input(format!("invalid input for fs_write: {e}")))?;

        if let Err(e) = ctx.sandbox.fs().write(&input.path, &input.content).await {
            return Ok(json!({
                "ok": false,
                "error": format!("failed to write file: {e}"),
                "recommendations": [
                    "Check that the path is correct",
                    "Verify write permissions",
                    "Confirm there is disk space available",
                ],
            }));
        }

        Ok(json!({
            "ok": true,
            "path": input.path,
            "bytes": input.content.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{MockSandbox, Sandbox};
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_and_reports_bytes() {
        let sandbox = Arc::new(MockSandbox::new());
        let ctx = ToolContext::new("agt:test", sandbox.clone());

        let result = FsWriteTool
            .execute(&json!({"path": "out.txt", "content": "hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["ok"], json!(true));
        assert_eq!(result["bytes"], json!(5));
        assert_eq!(sandbox.fs().read("out.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn wrong_input_shape_is_input_error() {
        let ctx = ToolContext::new("agt:test", Arc::new(MockSandbox::new()));
        let err = FsWriteTool
            .execute(&json!({"path": "out.txt"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "input");
    }
}
