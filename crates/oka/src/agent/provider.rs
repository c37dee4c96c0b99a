//! LLM providers backed by Rig.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

use rig::completion::{CompletionModel, ToolDefinition};
use rig::message::{AssistantContent, Message as RigMessage, ToolResultContent, UserContent};
use rig::providers::{anthropic, gemini, openai};
use rig::OneOrMany;

use super::message::{Message, Part, Role, ToolCall};
use super::model::{Model, ModelResponse};
use crate::config::{LlmConfig, LlmProviderKind};
use crate::mcp::ToolDescriptor;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";

/// A [`Model`] over any Rig completion model.
pub struct RigModel<M: CompletionModel> {
    model: M,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
}

impl<M: CompletionModel> RigModel<M> {
    pub fn new(model: M, config: &LlmConfig) -> Self {
        Self {
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl<M: CompletionModel> Model for RigModel<M> {
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse> {
        let Conversation {
            preamble,
            mut history,
        } = to_conversation(messages)?;
        let prompt = history
            .pop()
            .ok_or_else(|| anyhow!("cannot call the model without messages"))?;

        let mut request = self
            .model
            .completion_request(prompt)
            .preamble(preamble)
            .messages(history)
            .tools(tools.iter().map(to_tool_definition).collect());
        if let Some(temperature) = self.temperature {
            request = request.temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.max_tokens(max_tokens);
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("completion request failed: {}", e))?;

        let mut result = ModelResponse::default();
        for content in response.choice.into_iter() {
            match content {
                AssistantContent::Text(text) => result.content.push_str(&text.text),
                AssistantContent::ToolCall(call) => result.tool_calls.push(ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments.to_string(),
                }),
                #[allow(unreachable_patterns)]
                _ => {}
            }
        }
        Ok(result)
    }
}

fn to_tool_definition(tool: &ToolDescriptor) -> ToolDefinition {
    ToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters: tool.parameters.clone(),
    }
}

/// History in Rig's shape: system text goes to the preamble, consecutive
/// turns of the same side are merged.
struct Conversation {
    preamble: String,
    history: Vec<RigMessage>,
}

enum Turn {
    User(Vec<UserContent>),
    Assistant(Vec<AssistantContent>),
}

fn to_conversation(messages: &[Message]) -> Result<Conversation> {
    let mut preamble = Vec::new();
    let mut turns: Vec<Turn> = Vec::new();

    for message in messages {
        match message.role {
            Role::System => preamble.push(message.text()),
            Role::Human | Role::Tool => {
                let contents = message.parts.iter().map(|part| match part {
                    Part::Text { text } => UserContent::text(text.clone()),
                    Part::ToolResult(result) => UserContent::tool_result(
                        result.call_id.clone(),
                        OneOrMany::one(ToolResultContent::text(result.content.clone())),
                    ),
                    Part::ToolCall(call) => UserContent::text(call.arguments.clone()),
                });
                match turns.last_mut() {
                    Some(Turn::User(existing)) => existing.extend(contents),
                    _ => turns.push(Turn::User(contents.collect())),
                }
            }
            Role::Assistant => {
                let mut contents = Vec::new();
                for part in &message.parts {
                    contents.push(match part {
                        Part::Text { text } => AssistantContent::text(text.clone()),
                        Part::ToolCall(call) => {
                            let arguments = if call.arguments.trim().is_empty() {
                                serde_json::json!({})
                            } else {
                                serde_json::from_str(&call.arguments)
                                    .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone()))
                            };
                            AssistantContent::tool_call(call.id.clone(), call.name.clone(), arguments)
                        }
                        Part::ToolResult(result) => AssistantContent::text(result.content.clone()),
                    });
                }
                match turns.last_mut() {
                    Some(Turn::Assistant(existing)) => existing.extend(contents),
                    _ => turns.push(Turn::Assistant(contents)),
                }
            }
        }
    }

    let history = turns
        .into_iter()
        .map(|turn| match turn {
            Turn::User(contents) => OneOrMany::many(contents)
                .map(|content| RigMessage::User { content })
                .map_err(|_| anyhow!("empty user turn")),
            Turn::Assistant(contents) => OneOrMany::many(contents)
                .map(|content| RigMessage::Assistant { content })
                .map_err(|_| anyhow!("empty assistant turn")),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Conversation {
        preamble: preamble.join("\n\n"),
        history,
    })
}

/// Canned model for dry runs: ends every session on its first call.
pub struct MockModel;

#[async_trait]
impl Model for MockModel {
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse> {
        let alert = messages
            .iter()
            .find(|message| message.role == Role::Human)
            .map(|message| message.text())
            .unwrap_or_default();
        Ok(ModelResponse::text(format!(
            "Received alert ({} bytes) with {} tools available. No model is configured, so no analysis was done.\n\nInvestigation complete.",
            alert.len(),
            tools.len()
        )))
    }
}

/// The configured token, or the provider's API key variable.
fn api_key(config: &LlmConfig, env_var: &str) -> Result<String> {
    if let Some(token) = config.token.as_ref().filter(|token| !token.is_empty()) {
        return Ok(token.clone());
    }
    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => Err(anyhow!("no API key: set llm.token or {}", env_var)),
    }
}

/// Create the model selected by configuration.
pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn Model>> {
    match config.provider {
        LlmProviderKind::Anthropic => {
            let key = api_key(config, "ANTHROPIC_API_KEY")?;
            let client = anthropic::Client::new(
                &key,
                config.endpoint.as_deref().unwrap_or(ANTHROPIC_API_URL),
                None,
                anthropic::ANTHROPIC_VERSION_LATEST,
            );
            let model = client.completion_model(&config.model);
            Ok(Arc::new(RigModel::new(model, config)))
        }
        LlmProviderKind::OpenAI => {
            let key = api_key(config, "OPENAI_API_KEY")?;
            let client = match &config.endpoint {
                Some(endpoint) => openai::Client::from_url(&key, endpoint),
                None => openai::Client::new(&key),
            };
            let model = client.completion_model(&config.model);
            Ok(Arc::new(RigModel::new(model, config)))
        }
        LlmProviderKind::Google => {
            let key = api_key(config, "GEMINI_API_KEY")?;
            let client = match &config.endpoint {
                Some(endpoint) => gemini::Client::from_url(&key, endpoint),
                None => gemini::Client::new(&key),
            };
            let model = client.completion_model(&config.model);
            Ok(Arc::new(RigModel::new(model, config)))
        }
        LlmProviderKind::Mock => Ok(Arc::new(MockModel)),
    }
}
