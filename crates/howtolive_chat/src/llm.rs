//! LLM-backed handlers over an OpenAI-compatible chat completions API.
//!
//! [`LlmClient`] is a process-tier resource: one HTTP client shared by every
//! handler. Handlers stream their answer and emit the growing text after each
//! chunk; the router uses a JSON-schema structured output and never streams.
//! Requests are not retried.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use howtolive_core::{
    Classifier, ClassifierOutput, Closeable, ConversationMemory, CoreError, CoreResult, Handler,
    HookRegistry, Message, Role, RoutingSchema, Stateful,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::{LlmConfig, SpecialistConfig};
use crate::error::{ChatError, ChatResult};

/// Name of the router in logs, snapshots and timeline events.
pub const ROUTER_NAME: &str = "general-router";

/// Shared chat completions client.
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl LlmClient {
    /// Build a client. Fails when no API key was resolved.
    pub fn new(config: &LlmConfig) -> ChatResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ChatError::LlmNotConfigured)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::Llm(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            closed: AtomicBool::new(false),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request(&self, messages: &[WireMessage], stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: None,
        }
    }

    async fn send(&self, request: &CompletionRequest) -> ChatResult<reqwest::Response> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChatError::Llm("client is closed".to_string()));
        }

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Llm(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Llm(format!("API error {}: {}", status, body)));
        }
        Ok(response)
    }

    /// Stream a completion as text increments.
    pub async fn stream_chat(
        &self,
        messages: &[WireMessage],
    ) -> ChatResult<BoxStream<'static, ChatResult<String>>> {
        let response = self.send(&self.request(messages, true)).await?;
        let bytes = response.bytes_stream().boxed();

        let pieces = stream::unfold(
            (bytes, SseDecoder::default(), VecDeque::new(), false),
            |(mut bytes, mut decoder, mut pending, mut done)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (bytes, decoder, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            for event in decoder.feed(&chunk) {
                                match event {
                                    SseEvent::Done => {
                                        done = true;
                                        break;
                                    }
                                    SseEvent::Data(data) => match parse_stream_chunk(&data) {
                                        Ok(Some(text)) => pending.push_back(Ok(text)),
                                        Ok(None) => {}
                                        Err(e) => {
                                            pending.push_back(Err(e));
                                            done = true;
                                            break;
                                        }
                                    },
                                }
                            }
                        }
                        Some(Err(e)) => {
                            pending.push_back(Err(ChatError::Llm(format!("Stream error: {}", e))));
                            done = true;
                        }
                        None => done = true,
                    }
                }
            },
        );
        Ok(pieces.boxed())
    }

    /// Non-streamed completion constrained to a JSON schema.
    pub async fn complete_json(
        &self,
        messages: &[WireMessage],
        schema_name: &str,
        schema: Value,
    ) -> ChatResult<Value> {
        let mut request = self.request(messages, false);
        request.response_format = Some(json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema_name,
                "schema": schema,
                "strict": true,
            }
        }));

        let response: CompletionResponse = self
            .send(&request)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::Llm(format!("Failed to parse response: {}", e)))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ChatError::Llm("No content in response".to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| ChatError::Llm(format!("Structured output is not JSON: {}", e)))
    }
}

#[async_trait]
impl Closeable for LlmClient {
    async fn close(&self) -> CoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(model = %self.model, "LLM client closed");
        Ok(())
    }
}

// ============================================================================
// Wire format
// ============================================================================

/// One chat message as sent to the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl WireMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: role.as_str().to_string(),
            content: content.into(),
        }
    }
}

/// System prompt, then remembered turns with text, then the new message.
pub fn build_prompt(system_prompt: &str, history: &[Message], message: &Message) -> Vec<WireMessage> {
    let mut messages = vec![WireMessage::new(Role::System, system_prompt)];
    messages.extend(
        history
            .iter()
            .chain(std::iter::once(message))
            .filter(|m| m.role != Role::System)
            .map(|m| (m.role, m.text()))
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(role, text)| WireMessage::new(role, text)),
    );
    messages
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDeltaBody,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDeltaBody {
    content: Option<String>,
}

/// Server-sent event relevant to completions.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` events. Chunks may cut lines anywhere,
/// including inside a multi-byte character; bytes are decoded per full line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !data.is_empty() {
                events.push(SseEvent::Data(data.to_string()));
            }
        }
        events
    }
}

/// Text increment carried by one stream chunk, if any.
fn parse_stream_chunk(data: &str) -> ChatResult<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| ChatError::Llm(format!("Malformed stream chunk: {}", e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty()))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler answering through the shared client.
pub struct LlmHandler {
    name: String,
    system_prompt: String,
    client: Arc<LlmClient>,
    memory: ConversationMemory,
    hooks: HookRegistry,
}

impl LlmHandler {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>, client: Arc<LlmClient>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            client,
            memory: ConversationMemory::new(),
            hooks: HookRegistry::new(),
        }
    }

    pub fn specialist(config: &SpecialistConfig, client: Arc<LlmClient>) -> Self {
        Self::new(&config.name, config.effective_prompt(), client)
    }
}

impl Stateful for LlmHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory(&self) -> &ConversationMemory {
        &self.memory
    }
}

#[async_trait]
impl Handler for LlmHandler {
    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    async fn reply(&self, message: &Message) -> CoreResult<Message> {
        let prompt = build_prompt(&self.system_prompt, &self.memory.get(), message);
        let failed = |e: ChatError| CoreError::handler_failed(&self.name, e.to_string());

        let mut pieces = self.client.stream_chat(&prompt).await.map_err(failed)?;
        let mut full = String::new();
        while let Some(piece) = pieces.next().await {
            full.push_str(&piece.map_err(failed)?);
            self.emit(&Message::assistant(&self.name, full.clone())).await;
        }

        let reply = Message::assistant(&self.name, full);
        self.memory.add(message.clone());
        self.memory.add(reply.clone());
        Ok(reply)
    }
}

/// Router producing a structured routing choice.
pub struct LlmClassifier {
    system_prompt: String,
    client: Arc<LlmClient>,
    memory: ConversationMemory,
}

impl LlmClassifier {
    pub fn new(specialists: &[SpecialistConfig], client: Arc<LlmClient>) -> Self {
        Self {
            system_prompt: router_prompt(specialists),
            client,
            memory: ConversationMemory::new(),
        }
    }
}

/// Routing instructions listing every specialist.
pub fn router_prompt(specialists: &[SpecialistConfig]) -> String {
    let mut prompt = String::from(
        "You route a user's message to exactly one specialist. Never answer the message.\n\
         Reply with `your_choice` set to one of the labels below and a short `note`.\n\n",
    );
    for specialist in specialists {
        prompt.push_str(&format!("- {}: {}\n", specialist.name, specialist.description));
    }
    prompt.push_str(
        "- general: anything else about healthy living\n\
         - none: greetings, small talk or unrelated requests\n",
    );
    prompt
}

impl Stateful for LlmClassifier {
    fn name(&self) -> &str {
        ROUTER_NAME
    }

    fn memory(&self) -> &ConversationMemory {
        &self.memory
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn invoke(&self, message: &Message, schema: &RoutingSchema) -> CoreResult<ClassifierOutput> {
        self.memory.add(message.clone());
        let prompt = build_prompt(&self.system_prompt, &[], message);

        let metadata = self
            .client
            .complete_json(&prompt, "routing_choice", schema.to_json_schema())
            .await
            .map_err(|e| CoreError::Classification(e.to_string()))?;

        info!(router = ROUTER_NAME, %metadata, "Routing output");
        Ok(ClassifierOutput::new(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchClassifier;
    use crate::stream::{stream_reply, StreamOptions, StreamOutcome};
    use howtolive_core::RoutingDecision;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config(key: Option<&str>) -> LlmConfig {
        LlmConfig {
            api_key: key.map(str::to_string),
            base_url: "http://localhost:9/v1/".to_string(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_client_requires_key() {
        assert!(matches!(LlmClient::new(&config(None)), Err(ChatError::LlmNotConfigured)));
        assert!(LlmClient::new(&config(Some("  "))).is_err());

        let client = LlmClient::new(&config(Some("sk-test"))).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:9/v1/chat/completions");
        assert_eq!(client.model(), "gpt-4o-mini");
    }

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"data: {\"a\"").is_empty());
        let events = decoder.feed(b":1}\n\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
        );
    }

    #[test]
    fn test_sse_decoder_keeps_characters_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"高蛋白\"}}]}\n";
        let bytes = line.as_bytes();
        let cut = line.find('高').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(&bytes[..cut]).is_empty());
        let events = decoder.feed(&bytes[cut..]);

        let SseEvent::Data(data) = &events[0] else {
            panic!("expected data event, got {:?}", events);
        };
        assert_eq!(parse_stream_chunk(data).unwrap().as_deref(), Some("高蛋白"));
    }

    #[test]
    fn test_parse_stream_chunk() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_stream_chunk(data).unwrap().as_deref(), Some("Hel"));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_stream_chunk(role_only).unwrap(), None);

        assert!(parse_stream_chunk("not json").is_err());
    }

    #[test]
    fn test_build_prompt_skips_blank_and_system() {
        let history = vec![
            Message::system("old system"),
            Message::user("hi"),
            Message::assistant("howtocook", ""),
            Message::assistant("howtocook", "hello"),
        ];
        let prompt = build_prompt("be brief", &history, &Message::user("dinner?"));
        let roles: Vec<&str> = prompt.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(prompt[0].content, "be brief");
        assert_eq!(prompt[3].content, "dinner?");
    }

    #[test]
    fn test_router_prompt_lists_labels() {
        let prompt = router_prompt(&[SpecialistConfig::new("howtocook", "Recipes.")]);
        assert!(prompt.contains("- howtocook: Recipes."));
        assert!(prompt.contains("- none:"));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let client = LlmClient::new(&config(Some("sk-test"))).unwrap();
        client.close().await.unwrap();
        let err = client
            .stream_chat(&[WireMessage::new(Role::User, "hi")])
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("closed"));
    }

    // ========================================================================
    // Canned chat completions endpoint
    // ========================================================================

    struct Canned {
        status: &'static str,
        content_type: &'static str,
        body: String,
    }

    impl Canned {
        fn sse(pieces: &[&str]) -> Self {
            let mut body = String::from(
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            );
            for piece in pieces {
                let chunk = json!({"choices": [{"delta": {"content": piece}}]});
                body.push_str(&format!("data: {}\n\n", chunk));
            }
            body.push_str("data: [DONE]\n\n");
            Self {
                status: "200 OK",
                content_type: "text/event-stream",
                body,
            }
        }

        fn structured(payload: Value) -> Self {
            let body = json!({
                "choices": [{"message": {"role": "assistant", "content": payload.to_string()}}]
            });
            Self {
                status: "200 OK",
                content_type: "application/json",
                body: body.to_string(),
            }
        }

        fn error(status: &'static str) -> Self {
            Self {
                status,
                content_type: "application/json",
                body: "{\"error\":{\"message\":\"upstream down\"}}".to_string(),
            }
        }
    }

    /// Serves one canned response per connection, in order, and records the
    /// JSON request bodies.
    async fn serve(responses: Vec<Canned>) -> (LlmConfig, Arc<Mutex<Vec<Value>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = requests.clone();
        tokio::spawn(async move {
            for canned in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let body = read_request(&mut socket).await;
                seen.lock().push(serde_json::from_slice(&body).unwrap_or(Value::Null));

                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    canned.status,
                    canned.content_type,
                    canned.body.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(canned.body.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        let mut config = config(Some("sk-test"));
        config.base_url = format!("http://{}/v1", addr);
        (config, requests)
    }

    async fn read_request(socket: &mut TcpStream) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            data.extend_from_slice(&buf[..n]);
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let headers = String::from_utf8_lossy(&data[..header_end]).to_lowercase();
        let length: usize = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        while data.len() < header_end + length {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        data[header_end..].to_vec()
    }

    fn fast() -> StreamOptions {
        StreamOptions {
            idle_timeout: Duration::from_secs(5),
            channel_capacity: 8,
        }
    }

    #[tokio::test]
    async fn test_stream_chat_yields_text_pieces() {
        let (config, requests) = serve(vec![Canned::sse(&["Hel", "lo"])]).await;
        let client = LlmClient::new(&config).unwrap();

        let pieces: Vec<String> = client
            .stream_chat(&[WireMessage::new(Role::User, "hi")])
            .await
            .unwrap()
            .map(|p| p.unwrap())
            .collect()
            .await;
        assert_eq!(pieces, vec!["Hel", "lo"]);

        let request = requests.lock()[0].clone();
        assert_eq!(request["stream"], true);
        assert_eq!(request["model"], "gpt-4o-mini");
        assert_eq!(request["messages"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_llm_handler_streams_growing_text_and_remembers_turn() {
        let (config, requests) = serve(vec![Canned::sse(&["Grill ", "salmon", " tonight."])]).await;
        let client = Arc::new(LlmClient::new(&config).unwrap());
        let handler = Arc::new(LlmHandler::new("howtocook", "You are a cook.", client));

        let mut stream = stream_reply(handler.clone(), Message::user("protein dinner?"), fast());
        let mut deltas = Vec::new();
        while let Some(delta) = stream.next().await {
            deltas.push(delta);
        }

        let texts: Vec<&str> = deltas.iter().map(|d| d.delta.as_str()).collect();
        assert_eq!(texts, vec!["Grill ", "salmon", " tonight.", ""]);
        assert!(deltas.last().unwrap().is_final);
        assert_eq!(deltas.last().unwrap().accumulated, "Grill salmon tonight.");
        assert!(stream.outcome().unwrap().is_completed());

        let memory = handler.memory().get();
        let roles: Vec<Role> = memory.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(memory[0].text(), "protein dinner?");
        assert_eq!(memory[1].text(), "Grill salmon tonight.");
        assert!(handler.hooks().is_empty());

        let request = requests.lock()[0].clone();
        assert_eq!(request["messages"][0]["role"], "system");
        assert_eq!(request["messages"][0]["content"], "You are a cook.");
        assert_eq!(request["messages"][1]["content"], "protein dinner?");
    }

    #[tokio::test]
    async fn test_llm_handler_sends_history_on_next_turn() {
        let (config, requests) =
            serve(vec![Canned::sse(&["Eggs."]), Canned::sse(&["Oats."])]).await;
        let client = Arc::new(LlmClient::new(&config).unwrap());
        let handler = LlmHandler::new("howtoeat", "Nutrition.", client);

        handler.reply(&Message::user("breakfast?")).await.unwrap();
        let reply = handler.reply(&Message::user("something else?")).await.unwrap();
        assert_eq!(reply.text(), "Oats.");
        assert_eq!(handler.memory().len(), 4);

        let contents: Vec<String> = requests.lock()[1]["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["Nutrition.", "breakfast?", "Eggs.", "something else?"]);
    }

    #[tokio::test]
    async fn test_llm_handler_api_error_fails_turn() {
        let (config, _) = serve(vec![Canned::error("500 Internal Server Error")]).await;
        let client = Arc::new(LlmClient::new(&config).unwrap());
        let handler = Arc::new(LlmHandler::new("howtosleep", "Sleep.", client));

        let (text, outcome) = stream_reply(handler.clone(), Message::user("tired"), fast())
            .collect()
            .await;
        assert!(matches!(outcome, StreamOutcome::Failed(ref reason) if reason.contains("500")));
        assert!(text.contains("[Error]"));
        assert!(handler.memory().is_empty());
    }

    #[tokio::test]
    async fn test_llm_classifier_routes_with_structured_output() {
        let (config, requests) = serve(vec![
            Canned::structured(json!({"your_choice": "howtocook", "note": "wants a recipe"})),
            Canned::structured(json!({"your_choice": "howtobake", "note": null})),
        ])
        .await;
        let client = Arc::new(LlmClient::new(&config).unwrap());
        let specialists = vec![
            SpecialistConfig::new("howtoeat", "Nutrition."),
            SpecialistConfig::new("howtocook", "Recipes."),
        ];
        let classifier = LlmClassifier::new(&specialists, client);
        let dispatch = DispatchClassifier::new(RoutingSchema::new(["howtoeat", "howtocook"]));

        let decision = dispatch
            .classify(&classifier, &Message::user("I want a high-protein dinner recipe"))
            .await;
        assert_eq!(decision.label, "howtocook");
        assert_eq!(decision.note.as_deref(), Some("wants a recipe"));

        let off_schema = dispatch.classify(&classifier, &Message::user("bread?")).await;
        assert_eq!(off_schema.label, RoutingDecision::GENERAL);
        assert_eq!(classifier.memory().len(), 2);

        let request = requests.lock()[0].clone();
        assert_eq!(request["stream"], false);
        assert_eq!(request["response_format"]["type"], "json_schema");
        let labels = &request["response_format"]["json_schema"]["schema"]["properties"]["your_choice"]["enum"];
        assert_eq!(labels, &json!(["howtoeat", "howtocook", "general", "none"]));
    }
}
