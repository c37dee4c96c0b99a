//! System prompt for alert investigations.

use serde_json::json;

use crate::template;
use crate::Result;

/// Phrase the model uses to end a session, matched case-insensitively.
pub const END_SESSION_PHRASE: &str = "investigation complete";

/// Appended before the last permitted model call.
pub const FINAL_CALL_INSTRUCTION: &str =
    "You must now complete your investigation and provide a final response.";

/// Sent when the model answers without proposing any tool call.
pub const MOTIVATION_TEXT: &str = "Provide next steps to continue the investigation.";

pub const SYSTEM_PROMPT_TEMPLATE: &str = r#"You are an on-call engineer investigating a production alert.
The alert payload is the first message of this conversation.

Your goal is to find the most likely root cause and explain it to the team.

When investigating:
1. Read the alert and note the affected system, severity and any linked runbook
2. Gather evidence with the available tools, one focused step at a time
3. Correlate findings across sources before drawing conclusions
4. Prefer read-only actions; never change the state of a system

When you are done, write a short report with:
- Summary of the alert
- Evidence collected
- Root cause, or the best hypothesis with its confidence
- Recommended next actions
{% if slack_handle %}
Address the report to {{ slack_handle }}.
{% endif %}
End the report with the exact phrase "{{ end_session_phrase }}". Do not use that phrase anywhere else.
"#;

/// Render the system prompt for a session.
pub fn render_system_prompt(slack_handle: &str) -> Result<String> {
    template::render(
        SYSTEM_PROMPT_TEMPLATE,
        &json!({
            "slack_handle": slack_handle,
            "end_session_phrase": END_SESSION_PHRASE,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_end_phrase() {
        let prompt = render_system_prompt("").unwrap();
        assert!(prompt.contains("\"investigation complete\""));
        assert!(!prompt.contains("Address the report"));
    }

    #[test]
    fn test_prompt_addresses_slack_handle() {
        let prompt = render_system_prompt("@sre-oncall").unwrap();
        assert!(prompt.contains("Address the report to @sre-oncall."));
    }
}
