use crate::client::{endpoint, CallContext, RetryingClient};
use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

/// One completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend to constrain output to a JSON object
    pub json_mode: bool,
}

/// Content-analysis capability
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Return the raw text of the first completion choice
    async fn complete(&self, ctx: &CallContext, request: &CompletionRequest) -> Result<String>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions backend
pub struct HttpLanguageModel {
    client: Arc<RetryingClient>,
    url: Url,
    model: String,
    api_key: Option<String>,
}

impl HttpLanguageModel {
    pub fn new(
        client: Arc<RetryingClient>,
        config: &AnalysisConfig,
        api_key: Option<String>,
    ) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("Invalid analysis URL: {}", e)))?;
        Ok(Self {
            client,
            url: endpoint(&base, "v1/chat/completions")?,
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn complete(&self, ctx: &CallContext, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response: ChatResponse = self
            .client
            .send_json(ctx, "analysis.complete", || {
                let req = self.client.http().post(self.url.clone()).json(&body);
                match &self.api_key {
                    Some(key) => req.bearer_auth(key),
                    None => req,
                }
            })
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::AnalysisParse("completion has no content".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
