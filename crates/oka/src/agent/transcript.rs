//! Per-session audit log.
//!
//! One append-only markdown-like file per session at
//! `<dir>/session-<id>.log`. Every section is flushed before the session
//! moves on. Writes go through `tokio::fs` so a slow disk parks the session
//! task instead of a runtime worker.

use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::mcp::ToolDescriptor;
use crate::Result;

pub struct Transcript {
    path: PathBuf,
    file: File,
    failed: bool,
}

impl Transcript {
    pub async fn create(dir: &Path, session_id: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("session-{}.log", session_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file,
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&mut self, text: &str) {
        let written = match self.file.write_all(text.as_bytes()).await {
            Ok(()) => self.file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // Only report the first failure per session.
            if !self.failed {
                warn!(path = %self.path.display(), "Failed to write transcript: {}", e);
                self.failed = true;
            }
        }
    }

    pub async fn header(&mut self, session_id: &str, alert: &str, prompt: &str, tools: &[ToolDescriptor]) {
        let mut text = format!(
            "# Session initialized: {}\n\n## Alert\n{}\n\n## Prompt\n{}\n\n## Tools\n",
            session_id, alert, prompt
        );
        for tool in tools {
            text.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
        text.push_str("\n# Session start LLM\n");
        self.write(&text).await;
    }

    pub async fn reasoning(&mut self, reasoning: &str) {
        self.write(&format!("\n## LLM reasoning\n{}\n", reasoning)).await;
    }

    pub async fn response(&mut self, content: &str) {
        self.write(&format!("\n## LLM response\n{}\n", content)).await;
    }

    pub async fn motivation(&mut self, text: &str) {
        self.write(&format!("\n## Insist LLM to provide next steps\n{}\n", text)).await;
    }

    pub async fn discarded_tool_calls(&mut self, names: &[&str]) {
        let text = format!(
            "\n## Call budget exhausted\ndiscarded tool calls: {}\n",
            names.join(", ")
        );
        self.write(&text).await;
    }

    pub async fn tool_call(&mut self, tool: &str, arguments: &str) {
        self.write(&format!("\n## Tool call\ntool: {}\nargs: {}\n", tool, arguments)).await;
    }

    pub async fn tool_response(&mut self, tool: &str, response: &str) {
        self.write(&format!("\n## Tool response\ntool: {}\n{}\n", tool, response)).await;
    }

    pub async fn error(&mut self, message: &str) {
        self.write(&format!("\n## Error\n{}\n", message)).await;
    }

    /// Trailing status line.
    pub async fn end(&mut self, status: &str) {
        self.write(&format!("\n# Session end: {}\n", status)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sections_are_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript = Transcript::create(&dir.path().join("sessions"), "abc")
            .await
            .unwrap();
        assert_eq!(
            transcript.path(),
            dir.path().join("sessions").join("session-abc.log")
        );

        let tools = vec![ToolDescriptor {
            name: "k8s_list_pods".to_string(),
            description: "List pods".to_string(),
            parameters: json!({"type": "object"}),
        }];
        transcript.header("abc", r#"{"alert":"DiskFull"}"#, "You are on call.", &tools).await;
        transcript.response("Checking pods.").await;
        let partial = tokio::fs::read_to_string(transcript.path()).await.unwrap();
        assert!(partial.ends_with("## LLM response\nChecking pods.\n"));
        transcript.tool_call("k8s_list_pods", r#"{"namespace":"default"}"#).await;
        transcript.tool_response("k8s_list_pods", "api-0 Running").await;
        transcript.end("complete").await;

        let content = std::fs::read_to_string(transcript.path()).unwrap();
        let expected_order = [
            "# Session initialized: abc",
            "## Alert\n{\"alert\":\"DiskFull\"}",
            "## Prompt\nYou are on call.",
            "## Tools\n- k8s_list_pods: List pods",
            "# Session start LLM",
            "## LLM response\nChecking pods.",
            "## Tool call\ntool: k8s_list_pods\nargs: {\"namespace\":\"default\"}",
            "## Tool response\ntool: k8s_list_pods\napi-0 Running",
            "# Session end: complete",
        ];
        let mut position = 0;
        for section in expected_order {
            let found = content[position..]
                .find(section)
                .unwrap_or_else(|| panic!("missing or out of order: {}", section));
            position += found + section.len();
        }
    }

    #[tokio::test]
    async fn test_reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        for message in ["first", "second"] {
            let mut transcript = Transcript::create(dir.path(), "same").await.unwrap();
            transcript.error(message).await;
        }

        let content = std::fs::read_to_string(dir.path().join("session-same.log")).unwrap();
        assert!(content.contains("first"));
        assert!(content.contains("second"));
    }
}
