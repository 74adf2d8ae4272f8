//! Model calls over an OpenAI-compatible chat completions endpoint.
//!
//! Streaming responses are read as server-sent events: each `data:` line
//! carries a JSON chunk whose `choices[0].delta.content` extends the answer,
//! and `data: [DONE]` ends the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cellforge_shared::{CellforgeError, GenerationRequest, InferenceConfig, Result, resolve_key};

use crate::cancel::CancelSignal;
use crate::prompt::render_generation_prompt;

const USER_AGENT: &str = concat!("Cellforge/", env!("CARGO_PKG_VERSION"));

/// One update of a streamed completion.
///
/// `value` is the accumulated answer so far. The last update of a stream has
/// `done` set, and carries `error` when the call failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionDelta {
    pub value: Option<String>,
    pub error: Option<String>,
    pub done: bool,
}

impl CompletionDelta {
    pub fn partial(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            error: None,
            done: false,
        }
    }

    pub fn finished(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            error: None,
            done: true,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            value: None,
            error: Some(error.into()),
            done: true,
        }
    }
}

/// The model-call collaborator.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream the answer for one row. The stream stops early, without a final
    /// `done` update, once `cancel` fires.
    fn stream_completion(
        &self,
        request: &GenerationRequest,
        cancel: &CancelSignal,
    ) -> BoxStream<'static, CompletionDelta>;

    /// Run a raw prompt to completion.
    async fn complete(
        &self,
        model_id: &str,
        provider_id: &str,
        prompt: &str,
        cancel: &CancelSignal,
    ) -> Result<String>;
}

/// Chat completions client (Hugging Face router, OpenAI, vLLM, ...).
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    endpoint: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn new(config: &InferenceConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| CellforgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            api_key: api_key.into(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Build a client with the token read from `config.api_key_env`.
    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        Self::new(config, resolve_key(&config.api_key_env)?)
    }

    fn body(&self, model_id: &str, provider_id: &str, prompt: &str, stream: bool) -> ChatRequest {
        ChatRequest {
            model: qualified_model(model_id, provider_id),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
        }
    }
}

/// `model:provider`, the router's way of pinning a provider.
fn qualified_model(model_id: &str, provider_id: &str) -> String {
    let provider = provider_id.trim();
    if provider.is_empty() || provider == "auto" {
        model_id.to_string()
    } else {
        format!("{model_id}:{provider}")
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn stream_completion(
        &self,
        request: &GenerationRequest,
        cancel: &CancelSignal,
    ) -> BoxStream<'static, CompletionDelta> {
        let prompt = render_generation_prompt(request);
        let body = self.body(&request.model_id, &request.provider_id, &prompt, true);
        let call = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        let cancel = cancel.clone();
        let row_index = request.row_index;

        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(row_index, "completion cancelled");
                }
                _ = pump_events(call, &tx) => {}
            }
        });
        rx.boxed()
    }

    async fn complete(
        &self,
        model_id: &str,
        provider_id: &str,
        prompt: &str,
        cancel: &CancelSignal,
    ) -> Result<String> {
        let body = self.body(model_id, provider_id, prompt, false);
        let call = async {
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| CellforgeError::Inference(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(CellforgeError::Inference(format!(
                    "completion failed ({status}): {text}"
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| CellforgeError::Inference(format!("invalid completion: {e}")))?;
            Ok(parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(CellforgeError::Inference("completion cancelled".into())),
            result = call => result,
        }
    }
}

/// Send the request and forward accumulated deltas until the stream ends.
async fn pump_events(call: reqwest::RequestBuilder, tx: &mpsc::UnboundedSender<CompletionDelta>) {
    let response = match call.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.unbounded_send(CompletionDelta::failed(e.to_string()));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let _ = tx.unbounded_send(CompletionDelta::failed(format!(
            "completion failed ({status}): {text}"
        )));
        return;
    }

    let mut bytes = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut answer = String::new();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "completion stream interrupted");
                let _ = tx.unbounded_send(CompletionDelta {
                    value: Some(answer),
                    error: Some(e.to_string()),
                    done: true,
                });
                return;
            }
        };

        for line in decoder.push(&chunk) {
            match line {
                SseLine::Content(text) => {
                    answer.push_str(&text);
                    if tx.unbounded_send(CompletionDelta::partial(answer.clone())).is_err() {
                        return;
                    }
                }
                SseLine::Done => {
                    let _ = tx.unbounded_send(CompletionDelta::finished(answer));
                    return;
                }
                SseLine::Skip => {}
            }
        }
    }

    let _ = tx.unbounded_send(CompletionDelta::finished(answer));
}

/// Splits raw body bytes into SSE lines. Bytes are held until a newline
/// arrives, so characters split across network chunks decode intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            lines.push(parse_sse_line(&String::from_utf8_lossy(&line)));
        }
        lines
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Content(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map_or(SseLine::Skip, SseLine::Content),
        Err(e) => {
            debug!(error = %e, "ignoring malformed event");
            SseLine::Skip
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenAiCompatClient {
        let config = InferenceConfig {
            endpoint: format!("{}/v1", server.uri()),
            timeout_ms: 5_000,
            ..InferenceConfig::default()
        };
        OpenAiCompatClient::new(&config, "token").unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model_id: "llama".into(),
            provider_id: "nebius".into(),
            instruction: "What is 2+2?".into(),
            data: BTreeMap::new(),
            examples: Vec::new(),
            sources_context: None,
            row_index: 0,
        }
    }

    fn sse(chunks: &[&str]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            let event = json!({"choices": [{"delta": {"content": chunk}}]});
            body.push_str(&format!("data: {event}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn sse_lines() {
        assert_eq!(parse_sse_line(": keep-alive\n"), SseLine::Skip);
        assert_eq!(parse_sse_line("data: [DONE]\n"), SseLine::Done);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseLine::Content("Hi".into())
        );
        assert_eq!(parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#), SseLine::Skip);
        assert_eq!(parse_sse_line("data: {broken"), SseLine::Skip);
    }

    #[test]
    fn split_characters_decode_intact() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9}\"}}]}\n";
        let bytes = event.as_bytes();
        let split = event.find('\u{e9}').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(
            decoder.push(&bytes[split..]),
            vec![SseLine::Content("caf\u{e9}".into())]
        );
    }

    #[test]
    fn provider_pins_model() {
        assert_eq!(qualified_model("llama", "nebius"), "llama:nebius");
        assert_eq!(qualified_model("llama", ""), "llama");
        assert_eq!(qualified_model("llama", "auto"), "llama");
    }

    #[tokio::test]
    async fn streams_accumulated_values() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer token"))
            .and(body_partial_json(json!({"model": "llama:nebius", "stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse(&["The answer", " is", " 4."])),
            )
            .mount(&server)
            .await;

        let deltas: Vec<CompletionDelta> = client(&server)
            .stream_completion(&request(), &CancelSignal::new())
            .collect()
            .await;

        let values: Vec<&str> = deltas.iter().filter_map(|d| d.value.as_deref()).collect();
        assert_eq!(values, vec!["The answer", "The answer is", "The answer is 4.", "The answer is 4."]);
        let last = deltas.last().unwrap();
        assert!(last.done);
        assert!(last.error.is_none());
        assert!(deltas[..deltas.len() - 1].iter().all(|d| !d.done));
    }

    #[tokio::test]
    async fn http_errors_end_the_stream_with_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let deltas: Vec<CompletionDelta> = client(&server)
            .stream_completion(&request(), &CancelSignal::new())
            .collect()
            .await;
        assert_eq!(deltas.len(), 1);
        assert!(deltas[0].done);
        assert!(deltas[0].error.as_deref().unwrap().contains("invalid token"));
    }

    #[tokio::test]
    async fn cancelled_stream_ends_without_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse(&["late"]))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let cancel = CancelSignal::new();
        cancel.cancel();
        let deltas: Vec<CompletionDelta> = client(&server)
            .stream_completion(&request(), &cancel)
            .collect()
            .await;
        assert!(deltas.iter().all(|d| !d.done));
    }

    #[tokio::test]
    async fn complete_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "DATASET NAME:\nRivers"}}]
            })))
            .mount(&server)
            .await;

        let text = client(&server)
            .complete("llama", "nebius", "make a dataset", &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(text, "DATASET NAME:\nRivers");
    }

    #[tokio::test]
    async fn complete_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server)
            .complete("llama", "", "hi", &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
