use crate::api::models::{HistoryTurn, Usage};
use crate::app::GeneratorConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub speaker_name: String,
    pub prompt: String,
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub text: String,
    pub usage: Option<Usage>,
    pub model: String,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generated>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    http: HttpClient,
    config: GeneratorConfig,
}

impl OpenAiClient {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Config(format!("could not build HTTP client: {e}")))?;
        Ok(Self { http, config: config.clone() })
    }

    fn system_message(speaker_name: &str, prompt: &str) -> String {
        let who = if speaker_name.trim().is_empty() { "an assistant" } else { speaker_name.trim() };
        format!("You are {who}, taking part in an automated warm-up conversation. {prompt}")
    }

    fn build_messages<'a>(&self, system: &'a str, history: &'a [HistoryTurn]) -> Vec<ChatMessage<'a>> {
        let skip = history.len().saturating_sub(self.config.history_limit);
        let mut messages = Vec::with_capacity(history.len() - skip + 1);
        messages.push(ChatMessage { role: "system", content: system });
        for turn in &history[skip..] {
            messages.push(ChatMessage {
                role: if turn.is_from_speaker { "assistant" } else { "user" },
                content: &turn.content,
            });
        }
        messages
    }
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generated> {
        if self.config.api_key.trim().is_empty() {
            return Err(Error::Config("text generator API key not configured; set OPENAI_API_KEY".into()));
        }
        if request.prompt.trim().is_empty() {
            return Err(Error::Validation("Prompt is required".into()));
        }

        let system = Self::system_message(&request.speaker_name, &request.prompt);
        let body = ChatRequest {
            model: &self.config.model,
            messages: self.build_messages(&system, &request.history),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        log::debug!(
            "generating for {} with {} messages",
            request.speaker_name,
            body.messages.len()
        );

        let endpoint = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&endpoint)
            .bearer_auth(self.config.api_key.trim())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::remote("text generation", e))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(Error::Remote(format!(
                "text generation failed: HTTP {} {}",
                status.as_u16(),
                detail.trim()
            )));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| Error::remote("invalid text generation response", e))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Remote("text generation returned no message".into()))?;

        Ok(Generated {
            text,
            usage: parsed.usage,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenAiClient {
        OpenAiClient::new(&GeneratorConfig {
            base_url: format!("{}/v1", server.uri()),
            api_key: "sk-test".into(),
            history_limit: 2,
            ..GeneratorConfig::default()
        })
        .unwrap()
    }

    fn request(history: Vec<HistoryTurn>) -> GenerationRequest {
        GenerationRequest {
            speaker_name: "Acct-A".into(),
            prompt: "Talk about the weekend.".into(),
            history,
        }
    }

    fn turn(content: &str, mine: bool) -> HistoryTurn {
        HistoryTurn { content: content.into(), is_from_speaker: mine }
    }

    #[tokio::test]
    async fn history_maps_to_roles_and_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "max_tokens": 150,
                "messages": [
                    {"role": "system", "content": "You are Acct-A, taking part in an automated warm-up conversation. Talk about the weekend."},
                    {"role": "user", "content": "hey"},
                    {"role": "assistant", "content": "hi!"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini-2024-07-18",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "  how was it?  "}}],
                "usage": {"prompt_tokens": 40, "completion_tokens": 4, "total_tokens": 44}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let history = vec![turn("dropped", true), turn("hey", false), turn("hi!", true)];
        let out = client(&server).generate(&request(history)).await.unwrap();
        assert_eq!(out.text, "how was it?");
        assert_eq!(out.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(out.usage.unwrap().total_tokens, 44);
    }

    #[tokio::test]
    async fn non_success_is_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = client(&server).generate(&request(vec![])).await.unwrap_err();
        match err {
            Error::Remote(msg) => assert!(msg.contains("429") && msg.contains("rate limited")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_choice_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        assert!(matches!(
            client(&server).generate(&request(vec![])).await,
            Err(Error::Remote(_))
        ));
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let c = OpenAiClient::new(&GeneratorConfig::default()).unwrap();
        assert!(matches!(c.generate(&request(vec![])).await, Err(Error::Config(_))));
    }
}
