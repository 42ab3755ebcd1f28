//! `fs_read`: read file contents from the sandbox filesystem.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxFs};

use super::{Tool, ToolContext};

pub struct FsReadTool;

#[derive(Debug, Deserialize)]
struct FsReadInput {
    path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs_read"
    }

    fn description(&self) -> &str {
        "Read file contents from the sandbox filesystem"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line offset to start reading from (optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (optional)"
                }
            },
            "required": ["path"]
        })
    }

    fn prompt(&self) -> String {
        "## fs_read\n\n\
         Reads a file from the sandbox work directory. Large files should be \
         read in slices with `offset` and `limit`; the response reports \
         `totalLines` and whether the content was truncated."
            .to_string()
    }

    async fn execute(&self, input: &Value, ctx: &ToolContext) -> Result<Value> {
        let input: FsReadInput = serde_json::from_value(input.clone())
            .map_err(|e| Error::Input(format!("invalid input for fs_read: {e}")))?;

        let content = match ctx.sandbox.fs().read(&input.path).await {
            Ok(content) => content,
            Err(e) => {
                return Ok(json!({
                    "ok": false,
                    "error": format!("failed to read file: {e}"),
                    "recommendations": [
                        "Check that the path is correct",
                        "Confirm the file exists in the sandbox",
                        "Verify read permissions",
                    ],
                }));
            }
        };

        let lines: Vec<&str> = content.split('\n').collect();
        let total_lines = lines.len();
        let offset = input.offset.unwrap_or(0);
        let limit = input.limit.unwrap_or(0);

        if offset >= total_lines {
            return Ok(json!({
                "ok": true,
                "path": input.path,
                "content": "",
                "offset": offset,
                "limit": limit,
                "truncated": false,
                "totalLines": total_lines,
                "readLines": 0,
            }));
        }

        let mut end = total_lines;
        let mut truncated = false;
        if limit > 0 && offset + limit < total_lines {
            end = offset + limit;
            truncated = true;
        }

        let selected = &lines[offset..end];
        Ok(json!({
            "ok": true,
            "path": input.path,
            "content": selected.join("\n"),
            "offset": offset,
            "limit": limit,
            "truncated": truncated,
            "totalLines": total_lines,
            "readLines": selected.len(),
        }))
    }
}
