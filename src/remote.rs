//! Remote Analysis Provider
//!
//! Chat-completion client for an OpenAI-compatible endpoint. Settings are
//! re-read from the `SettingsStore` on every call. No retries here; fallback
//! belongs to the orchestrator.

use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::analysis::{
    estimate_units, AnalysisKind, AnalysisResult, Conversation, ConversationMessage, ProviderResponse, UsageStats,
};
use crate::error::{classify_status, AnalysisError, AnalysisOutcome};
use crate::logging;
use crate::settings::{Settings, SettingsStore};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const STREAM_CHANNEL_CAPACITY: usize = 64;
const QUESTION_TEMPERATURE: f32 = 0.3;
const DONE_MARKER: &str = "[DONE]";

// ============ Wire Types ============

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Answer to a free-form question and the units it consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// Reported total usage, or a chars/4 estimate of the answer when absent
    pub units: u64,
}

// ============ Stream Decoding ============

/// What a finished stream produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub content: String,
    pub id: String,
    pub model: String,
    pub created: i64,
    pub finish_reason: Option<String>,
}

impl StreamOutcome {
    /// Normalized response; streams carry no usage, so it is estimated
    pub fn into_response(self) -> ProviderResponse {
        let usage = UsageStats::estimated_for(&self.content);
        let mut response = ProviderResponse::synthesized("stream", &self.model, &self.content, Some(usage));
        if !self.id.is_empty() {
            response.id = self.id;
        }
        if self.created > 0 {
            response.created = self.created;
        }
        if let Some(choice) = response.choices.first_mut() {
            choice.finish_reason = self.finish_reason;
        }
        response
    }
}

/// Incremental decoder for `data: ` event lines.
///
/// Bytes are buffered until a newline so a line split across transport
/// chunks (including inside a UTF-8 sequence) decodes whole.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    accumulated: String,
    id: String,
    model: String,
    created: i64,
    finish_reason: Option<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk; returns the accumulated text after each appended delta
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut snapshots = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&String::from_utf8_lossy(&line), &mut snapshots);
        }
        snapshots
    }

    /// Decode whatever is left once the transport ends
    pub fn finish(&mut self) -> Vec<String> {
        let mut snapshots = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&String::from_utf8_lossy(&line), &mut snapshots);
        }
        snapshots
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Final outcome. Empty text is still an outcome; callers decide what it means.
    pub fn into_outcome(self) -> StreamOutcome {
        StreamOutcome {
            content: self.accumulated,
            id: self.id,
            model: self.model,
            created: self.created,
            finish_reason: self.finish_reason,
        }
    }

    fn decode_line(&mut self, line: &str, snapshots: &mut Vec<String>) {
        let line = line.trim_end_matches(['\n', '\r']);
        let Some(payload) = line.strip_prefix("data: ") else {
            return;
        };
        let payload = payload.trim();
        if payload == DONE_MARKER || payload.is_empty() {
            return;
        }

        let chunk: StreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                logging::log_remote(None, &format!("Skipping malformed stream line: {}", e));
                return;
            }
        };

        if self.id.is_empty() {
            self.id = chunk.id;
        }
        if self.model.is_empty() {
            self.model = chunk.model;
        }
        if self.created == 0 {
            self.created = chunk.created;
        }

        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.accumulated.push_str(&content);
                snapshots.push(self.accumulated.clone());
            }
        }
    }
}

// ============ Stream Handle ============

#[derive(Debug)]
pub enum StreamEvent {
    /// Full accumulated text so far
    Chunk(String),
    /// Terminal event; nothing follows it
    Completed(AnalysisOutcome<StreamOutcome>),
}

/// Receiver side of a streaming request. Cancelling stops further events,
/// including `Completed`.
pub struct StreamHandle {
    pub events: mpsc::Receiver<StreamEvent>,
    pub cancel: CancellationToken,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ============ Provider ============

pub struct RemoteProvider {
    client: Client,
    settings: Arc<SettingsStore>,
}

impl RemoteProvider {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                logging::log_error(None, &format!("HTTP client build failed, using defaults: {}", e));
                Client::new()
            });
        Self { client, settings }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.current().is_remote_configured()
    }

    fn credential(settings: &Settings) -> AnalysisOutcome<String> {
        settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or(AnalysisError::CredentialMissing)
    }

    fn completion_request(
        &self,
        settings: &Settings,
        api_key: &str,
        conversation: &Conversation,
        max_tokens: Option<u32>,
        temperature: f32,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let body = ChatCompletionRequest {
            model: &settings.model,
            messages: conversation.messages(),
            max_tokens: max_tokens.unwrap_or(settings.single_request_limit),
            temperature,
            stream,
        };

        let request = self
            .client
            .post(settings.endpoint("chat/completions"))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body);

        if stream {
            request.header("Accept", "text/event-stream")
        } else {
            request.timeout(Duration::from_secs(settings.request_timeout_secs))
        }
    }

    /// Single non-streaming completion
    pub async fn chat_completion(
        &self,
        conversation: &Conversation,
        max_tokens: Option<u32>,
        temperature: f32,
    ) -> AnalysisOutcome<ProviderResponse> {
        let settings = self.settings.current();
        let api_key = Self::credential(&settings)?;

        logging::log_remote(
            None,
            &format!("POST chat/completions model={} messages={}", settings.model, conversation.len()),
        );

        let response = self
            .completion_request(&settings, &api_key, conversation, max_tokens, temperature, false)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let err = classify_status(status.as_u16(), &body);
            logging::log_error(None, &format!("Remote call failed: {}", err));
            return Err(err);
        }

        let parsed: ProviderResponse = serde_json::from_str(&body)
            .map_err(|e| AnalysisError::UnknownError(format!("Invalid response body: {}", e)))?;
        if parsed.first_content().is_none() {
            return Err(AnalysisError::EmptyResponse);
        }

        logging::log_remote(
            Some(&parsed.id),
            &format!(
                "Completed, {} units",
                parsed.usage.map(|u| u.total_units).unwrap_or_default()
            ),
        );
        Ok(parsed)
    }

    pub async fn analyze(&self, text: &str, kind: &AnalysisKind) -> AnalysisOutcome<AnalysisResult> {
        let response = self
            .chat_completion(&kind.conversation(text), None, kind.temperature())
            .await?;
        let content = response
            .first_content()
            .ok_or(AnalysisError::EmptyResponse)?
            .to_string();
        AnalysisResult::new(kind.clone(), content, response)
    }

    pub async fn answer_question(&self, question: &str, context: Option<&str>) -> AnalysisOutcome<Answer> {
        if question.trim().is_empty() {
            return Err(AnalysisError::invalid_input("question is empty"));
        }

        let mut messages = Vec::new();
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            messages.push(ConversationMessage::system(&format!(
                "Answer based on the following context:\n{}",
                context
            )));
        }
        messages.push(ConversationMessage::user(question));

        let response = self
            .chat_completion(&Conversation::new(messages)?, None, QUESTION_TEMPERATURE)
            .await?;
        let text = response
            .first_content()
            .ok_or(AnalysisError::EmptyResponse)?
            .to_string();
        let units = response
            .usage
            .map(|u| u.total_units)
            .unwrap_or_else(|| estimate_units(&text));
        Ok(Answer { text, units })
    }

    /// `GET {base}/models`; any 2xx counts as reachable
    pub async fn test_connection(&self) -> AnalysisOutcome<bool> {
        let settings = self.settings.current();
        let api_key = Self::credential(&settings)?;

        let response = self
            .client
            .get(settings.endpoint("models"))
            .header("Authorization", format!("Bearer {}", api_key))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }

    /// Start a streaming completion. Request and transport errors arrive as
    /// `StreamEvent::Completed(Err(..))`.
    pub fn stream_chat(
        &self,
        conversation: &Conversation,
        max_tokens: Option<u32>,
        temperature: f32,
    ) -> AnalysisOutcome<StreamHandle> {
        let settings = self.settings.current();
        let api_key = Self::credential(&settings)?;
        let request = self.completion_request(&settings, &api_key, conversation, max_tokens, temperature, true);

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        logging::log_remote(None, &format!("Streaming chat/completions model={}", settings.model));

        let idle = Duration::from_secs(settings.request_timeout_secs);

        tokio::spawn(async move {
            let response = tokio::select! {
                _ = task_cancel.cancelled() => return,
                sent = tokio::time::timeout(idle, request.send()) => sent,
            };
            match response {
                Ok(Ok(response)) => drive_stream(response, tx, task_cancel, idle).await,
                Ok(Err(e)) => {
                    let _ = tx.send(StreamEvent::Completed(Err(e.into()))).await;
                }
                Err(_) => {
                    let _ = tx.send(StreamEvent::Completed(Err(idle_timeout(idle)))).await;
                }
            }
        });

        Ok(StreamHandle { events: rx, cancel })
    }

    /// Stream an analysis, forwarding accumulated text to `partials`
    pub async fn analyze_streaming(
        &self,
        text: &str,
        kind: &AnalysisKind,
        partials: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> AnalysisOutcome<AnalysisResult> {
        let mut handle = self.stream_chat(&kind.conversation(text), None, kind.temperature())?;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    handle.cancel();
                    return Err(AnalysisError::Cancelled);
                }
                event = handle.events.recv() => event,
            };

            match event {
                Some(StreamEvent::Chunk(accumulated)) => {
                    // A dropped receiver only means nobody watches the partials
                    let _ = partials.send(accumulated).await;
                }
                Some(StreamEvent::Completed(outcome)) => {
                    let outcome = outcome?;
                    if outcome.content.trim().is_empty() {
                        return Err(AnalysisError::EmptyResponse);
                    }
                    let response = outcome.into_response();
                    let content = response
                        .first_content()
                        .ok_or(AnalysisError::EmptyResponse)?
                        .to_string();
                    return AnalysisResult::new(kind.clone(), content, response);
                }
                None => return Err(AnalysisError::Cancelled),
            }
        }
    }
}

fn idle_timeout(idle: Duration) -> AnalysisError {
    AnalysisError::NetworkError(format!("stream idle for {}s", idle.as_secs()))
}

/// Pump the event stream. Each read waits at most `idle`.
async fn drive_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    idle: Duration,
) {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status.as_u16(), &body);
        logging::log_error(None, &format!("Stream request failed: {}", err));
        if !cancel.is_cancelled() {
            let _ = tx.send(StreamEvent::Completed(Err(err))).await;
        }
        return;
    }

    let mut decoder = StreamDecoder::new();
    let mut stream = response.bytes_stream();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                logging::log_remote(None, "Stream cancelled");
                return;
            }
            next = tokio::time::timeout(idle, stream.next()) => next,
        };

        let Ok(next) = next else {
            let err = idle_timeout(idle);
            logging::log_error(None, &format!("Stream aborted: {}", err));
            let _ = tx.send(StreamEvent::Completed(Err(err))).await;
            return;
        };

        match next {
            Some(Ok(bytes)) => {
                for accumulated in decoder.feed(&bytes) {
                    if cancel.is_cancelled() || tx.send(StreamEvent::Chunk(accumulated)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                if !cancel.is_cancelled() {
                    let _ = tx.send(StreamEvent::Completed(Err(e.into()))).await;
                }
                return;
            }
            None => break,
        }
    }

    for accumulated in decoder.finish() {
        if cancel.is_cancelled() || tx.send(StreamEvent::Chunk(accumulated)).await.is_err() {
            return;
        }
    }

    if cancel.is_cancelled() {
        return;
    }
    let done = decoder.into_outcome();
    logging::log_remote(Some(&done.id), &format!("Stream finished, {} chars", done.content.chars().count()));
    let _ = tx.send(StreamEvent::Completed(Ok(done))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn delta_line(content: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "created": 1700000000,
                "model": "deepseek-chat",
                "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
            })
        )
    }

    fn completion_body(content: &str) -> String {
        serde_json::json!({
            "id": "chatcmpl-9",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "deepseek-chat",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20}
        })
        .to_string()
    }

    // ============ Decoder ============

    #[test]
    fn test_decoder_accumulates_and_ignores_done() {
        let mut decoder = StreamDecoder::new();
        let mut snapshots = decoder.feed(delta_line("Hel").as_bytes());
        snapshots.extend(decoder.feed(format!("{}data: [DONE]\n", delta_line("lo")).as_bytes()));
        assert_eq!(snapshots, vec!["Hel".to_string(), "Hello".to_string()]);

        let outcome = decoder.into_outcome();
        assert_eq!(outcome.content, "Hello");
        assert_eq!(outcome.id, "chatcmpl-1");
        assert_eq!(outcome.model, "deepseek-chat");
    }

    #[test]
    fn test_decoder_skips_malformed_line() {
        let mut decoder = StreamDecoder::new();
        let chunk = format!("data: {{not json\n{}", delta_line("ok"));
        let snapshots = decoder.feed(chunk.as_bytes());
        assert_eq!(snapshots, vec!["ok".to_string()]);
        assert_eq!(decoder.accumulated(), "ok");
    }

    #[test]
    fn test_decoder_is_repeatable() {
        let stream = format!("{}{}{}data: [DONE]\n", delta_line("a"), delta_line("b"), delta_line("c"));
        let chunks: Vec<&[u8]> = stream.as_bytes().chunks(7).collect();

        let run = || {
            let mut decoder = StreamDecoder::new();
            for chunk in &chunks {
                decoder.feed(chunk);
            }
            decoder.finish();
            decoder.into_outcome().content
        };
        assert_eq!(run(), "abc");
        assert_eq!(run(), run());
    }

    #[test]
    fn test_decoder_joins_split_multibyte_line() {
        let line = delta_line("研究");
        let bytes = line.as_bytes();
        let split = line.find("研").unwrap() + 1;

        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        assert_eq!(decoder.feed(&bytes[split..]), vec!["研究".to_string()]);
    }

    #[test]
    fn test_decoder_finish_flushes_unterminated_line() {
        let mut decoder = StreamDecoder::new();
        let line = delta_line("tail");
        assert!(decoder.feed(line.trim_end().as_bytes()).is_empty());
        assert_eq!(decoder.finish(), vec!["tail".to_string()]);
    }

    #[test]
    fn test_decoder_ignores_non_data_lines() {
        let mut decoder = StreamDecoder::new();
        let chunk = format!(": keep-alive\nevent: message\n\n{}", delta_line("x"));
        assert_eq!(decoder.feed(chunk.as_bytes()), vec!["x".to_string()]);
    }

    #[test]
    fn test_done_only_stream_yields_empty_outcome() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(b"data: [DONE]\n").is_empty());
        assert_eq!(decoder.into_outcome().content, "");
    }

    // ============ HTTP ============

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    /// One-shot server: answers a single request with `status` and `body`,
    /// returning the raw request text
    async fn serve_once(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });
        (format!("http://{}", addr), handle)
    }

    /// Event-stream server writing `chunks` with a pause between them, then
    /// holding the connection open for `hold` before closing
    async fn serve_stream(chunks: Vec<String>, hold: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for chunk in chunks {
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(hold).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn provider_for(base_url: &str, api_key: Option<&str>) -> RemoteProvider {
        let settings = Settings {
            api_key: api_key.map(str::to_string),
            base_url: base_url.to_string(),
            request_timeout_secs: 5,
            ..Settings::default()
        };
        RemoteProvider::new(Arc::new(SettingsStore::in_memory(settings)))
    }

    #[tokio::test]
    async fn test_analyze_success_sends_bearer_and_body() {
        let (base, server) = serve_once("200 OK", completion_body("Deep answer")).await;
        let provider = provider_for(&base, Some("sk-test"));

        let result = provider.analyze("Some text", &AnalysisKind::Insight).await.unwrap();
        assert_eq!(result.content, "Deep answer");
        assert_eq!(result.raw_response.usage.unwrap().total_units, 20);
        assert!(!result.is_local());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains("\"model\":\"deepseek-chat\""));
        assert!(request.contains("\"stream\":false"));
        assert!(request.contains("\"max_tokens\":2000"));
        assert!(request.contains("\"role\":\"system\""));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            ("401 Unauthorized", AnalysisError::InvalidCredential),
            ("429 Too Many Requests", AnalysisError::RateLimitExceeded),
        ];
        for (status, expected) in cases {
            let (base, _server) = serve_once(status, "{}".to_string()).await;
            let err = provider_for(&base, Some("sk")).analyze("t", &AnalysisKind::Insight).await.unwrap_err();
            assert_eq!(err, expected);
        }

        let (base, _server) = serve_once("500 Internal Server Error", "boom".to_string()).await;
        let err = provider_for(&base, Some("sk")).analyze("t", &AnalysisKind::Insight).await.unwrap_err();
        assert_eq!(err, AnalysisError::ServerError { status: 500, detail: "boom".to_string() });
    }

    #[tokio::test]
    async fn test_empty_choices_is_empty_response() {
        let body = serde_json::json!({"id": "x", "created": 1, "model": "m", "choices": []}).to_string();
        let (base, _server) = serve_once("200 OK", body).await;
        let err = provider_for(&base, Some("sk")).analyze("t", &AnalysisKind::Insight).await.unwrap_err();
        assert_eq!(err, AnalysisError::EmptyResponse);
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let provider = provider_for("http://127.0.0.1:9", None);
        assert!(!provider.is_configured());
        let err = provider.analyze("t", &AnalysisKind::Insight).await.unwrap_err();
        assert_eq!(err, AnalysisError::CredentialMissing);
        assert_eq!(provider.test_connection().await.unwrap_err(), AnalysisError::CredentialMissing);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = provider_for(&format!("http://{}", addr), Some("sk"));
        let err = provider.analyze("t", &AnalysisKind::Insight).await.unwrap_err();
        assert!(matches!(err, AnalysisError::NetworkError(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_answer_question_with_context() {
        let (base, server) = serve_once("200 OK", completion_body("42")).await;
        let provider = provider_for(&base, Some("sk"));
        let answer = provider.answer_question("What is it?", Some("The answer is 42.")).await.unwrap();
        assert_eq!(answer.text, "42");
        assert_eq!(answer.units, 20);

        let request = server.await.unwrap();
        assert!(request.contains("Answer based on the following context"));
        assert!(request.contains("\"temperature\":0.3"));
    }

    #[tokio::test]
    async fn test_connection_check() {
        let (base, server) = serve_once("200 OK", "{\"data\":[]}".to_string()).await;
        assert!(provider_for(&base, Some("sk")).test_connection().await.unwrap());
        assert!(server.await.unwrap().starts_with("GET /models"));

        let (base, _server) = serve_once("401 Unauthorized", "{}".to_string()).await;
        let err = provider_for(&base, Some("bad")).test_connection().await.unwrap_err();
        assert_eq!(err, AnalysisError::InvalidCredential);
    }

    #[tokio::test]
    async fn test_stream_delivers_growing_text_then_completes() {
        let chunks = vec![
            delta_line("The "),
            "data: {broken\n".to_string(),
            delta_line("answer"),
            "data: [DONE]\n".to_string(),
        ];
        let base = serve_stream(chunks, Duration::ZERO).await;
        let provider = provider_for(&base, Some("sk"));
        let conversation = AnalysisKind::Insight.conversation("text");
        let mut handle = provider.stream_chat(&conversation, None, 0.7).unwrap();

        let mut partials = Vec::new();
        let mut completed = None;
        while let Some(event) = handle.events.recv().await {
            match event {
                StreamEvent::Chunk(text) => {
                    assert!(completed.is_none());
                    partials.push(text);
                }
                StreamEvent::Completed(outcome) => completed = Some(outcome),
            }
        }

        assert_eq!(partials, vec!["The ".to_string(), "The answer".to_string()]);
        let outcome = completed.unwrap().unwrap();
        assert_eq!(outcome.content, "The answer");
        let response = outcome.into_response();
        assert_eq!(response.id, "chatcmpl-1");
        assert_eq!(response.usage.unwrap().total_units, 2);
    }

    #[tokio::test]
    async fn test_stream_error_status_completes_with_error() {
        let (base, _server) = serve_once("429 Too Many Requests", "{}".to_string()).await;
        let provider = provider_for(&base, Some("sk"));
        let mut handle = provider
            .stream_chat(&AnalysisKind::Insight.conversation("t"), None, 0.7)
            .unwrap();

        match handle.events.recv().await {
            Some(StreamEvent::Completed(Err(err))) => assert_eq!(err, AnalysisError::RateLimitExceeded),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(handle.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_cancel_stops_events() {
        let chunks = vec![delta_line("first"), delta_line(" second")];
        let base = serve_stream(chunks, Duration::from_secs(5)).await;
        let provider = provider_for(&base, Some("sk"));
        let mut handle = provider
            .stream_chat(&AnalysisKind::Insight.conversation("t"), None, 0.7)
            .unwrap();

        match handle.events.recv().await {
            Some(StreamEvent::Chunk(text)) => assert_eq!(text, "first"),
            other => panic!("unexpected event: {:?}", other),
        }
        handle.cancel();

        let rest = tokio::time::timeout(Duration::from_secs(2), async {
            let mut rest = Vec::new();
            while let Some(event) = handle.events.recv().await {
                rest.push(event);
            }
            rest
        })
        .await
        .unwrap();
        assert!(rest.iter().all(|e| !matches!(e, StreamEvent::Completed(_))));
    }

    #[tokio::test]
    async fn test_stream_without_content_completes_with_empty_text() {
        let base = serve_stream(vec!["data: [DONE]\n".to_string()], Duration::ZERO).await;
        let provider = provider_for(&base, Some("sk"));
        let mut handle = provider
            .stream_chat(&AnalysisKind::Insight.conversation("t"), None, 0.7)
            .unwrap();

        match handle.events.recv().await {
            Some(StreamEvent::Completed(Ok(outcome))) => assert_eq!(outcome.content, ""),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_streaming_rejects_empty_stream() {
        let base = serve_stream(vec!["data: [DONE]\n".to_string()], Duration::ZERO).await;
        let provider = provider_for(&base, Some("sk"));
        let (tx, _rx) = mpsc::channel(4);

        let err = provider
            .analyze_streaming("text", &AnalysisKind::Insight, tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, AnalysisError::EmptyResponse);
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let base = serve_stream(vec![delta_line("partial")], Duration::from_secs(10)).await;
        let settings = Settings {
            api_key: Some("sk".to_string()),
            base_url: base,
            request_timeout_secs: 1,
            ..Settings::default()
        };
        let provider = RemoteProvider::new(Arc::new(SettingsStore::in_memory(settings)));
        let mut handle = provider
            .stream_chat(&AnalysisKind::Insight.conversation("t"), None, 0.7)
            .unwrap();

        let events = tokio::time::timeout(Duration::from_secs(5), async {
            let mut events = Vec::new();
            while let Some(event) = handle.events.recv().await {
                events.push(event);
            }
            events
        })
        .await
        .unwrap();

        assert!(matches!(events.first(), Some(StreamEvent::Chunk(text)) if text == "partial"));
        match events.last() {
            Some(StreamEvent::Completed(Err(AnalysisError::NetworkError(detail)))) => {
                assert!(detail.contains("idle"), "{}", detail)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_streaming_forwards_partials() {
        let chunks = vec![delta_line("Part one."), delta_line(" Part two."), "data: [DONE]\n".to_string()];
        let base = serve_stream(chunks, Duration::ZERO).await;
        let provider = provider_for(&base, Some("sk"));
        let (tx, mut rx) = mpsc::channel(16);

        let result = provider
            .analyze_streaming("text", &AnalysisKind::DeepUnderstanding, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content, "Part one. Part two.");
        assert_eq!(result.raw_response.model, "deepseek-chat");

        let mut partials = Vec::new();
        while let Some(p) = rx.recv().await {
            partials.push(p);
        }
        assert_eq!(partials.last().map(String::as_str), Some("Part one. Part two."));
    }
}
