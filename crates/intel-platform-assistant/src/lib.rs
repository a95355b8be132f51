use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use intel_platform_core::{ChatMessage, ChatRole, IT_EXPERT_SYSTEM_PROMPT};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("no OpenAI API key configured")]
    MissingApiKey,
    #[error("network error: {0}")]
    Network(String),
    #[error("chat completion failed with status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode chat stream: {0}")]
    Decode(String),
    #[error("chat stream cancelled")]
    Cancelled,
}

/// Streaming reply event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Delta(String),
    Done { reply: String },
    Error(String),
}

/// Shared cancellation flag. Streams stop at the next chunk boundary, or immediately
/// when they are waiting on a silent upstream.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl Default for CancelHandle {
    fn default() -> Self {
        Self(Arc::new(watch::Sender::new(false)))
    }
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once [`CancelHandle::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        let mut flag = self.0.subscribe();
        let _ = flag.wait_for(|cancelled| *cancelled).await;
    }
}

/// Command-line and environment settings for the assistant.
#[derive(Debug, Clone, clap::Args)]
pub struct AssistantArgs {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub openai_base_url: String,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long)]
    pub max_tokens: Option<u32>,
}

impl AssistantArgs {
    #[must_use]
    pub fn into_config(self) -> AssistantConfig {
        AssistantConfig {
            api_key: self.openai_api_key,
            model: self.model,
            base_url: self.openai_base_url,
            timeout: Duration::from_secs(self.timeout_secs),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..AssistantConfig::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub system_prompt: String,
    pub timeout: Duration,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            system_prompt: IT_EXPERT_SYSTEM_PROMPT.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Delta(String),
    Done,
}

/// Incremental decoder for `data:` lines of a chat-completion event stream.
///
/// Chunks may split lines anywhere; bytes are buffered until a newline arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed one network chunk and return the frames it completed.
    ///
    /// # Errors
    /// Returns [`AssistantError::Decode`] when a complete line is not valid UTF-8
    /// or its payload is not a chat-completion chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, AssistantError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            if let Some(frame) = parse_line(&line)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Flush a trailing line that arrived without a newline.
    ///
    /// # Errors
    /// Same as [`SseDecoder::push`].
    pub fn finish(&mut self) -> Result<Option<SseFrame>, AssistantError> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(raw: &[u8]) -> Result<Option<SseFrame>, AssistantError> {
    let line = std::str::from_utf8(raw).map_err(|err| AssistantError::Decode(err.to_string()))?;
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(Some(SseFrame::Done));
    }
    if data.is_empty() {
        return Ok(None);
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|err| AssistantError::Decode(err.to_string()))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(SseFrame::Delta))
}

/// Client for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct ChatAssistant {
    config: AssistantConfig,
    client: reqwest::Client,
}

impl ChatAssistant {
    /// # Errors
    /// Returns [`AssistantError::Network`] when the HTTP client cannot be built.
    pub fn new(config: AssistantConfig) -> Result<Self, AssistantError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| AssistantError::Network(err.to_string()))?;
        Ok(Self { config, client })
    }

    #[must_use]
    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /// The system prompt followed by `history`, minus any system entries it carries.
    #[must_use]
    pub fn request_messages(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        std::iter::once(ChatMessage::system(self.config.system_prompt.clone()))
            .chain(history.iter().filter(|message| message.role != ChatRole::System).cloned())
            .collect()
    }

    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.config.api_key.as_deref().is_some_and(|key| !key.trim().is_empty())
    }

    /// Stream a reply to `history`, forwarding each text delta to `sender`.
    ///
    /// On success a final [`ChatEvent::Done`] carrying the full reply is sent and
    /// the same text is returned. On failure a [`ChatEvent::Error`] is sent when the
    /// receiver is still listening.
    ///
    /// # Errors
    /// Returns [`AssistantError::Cancelled`] when `cancel` fires or the receiver is
    /// dropped, and the other variants for configuration, transport or decode failures.
    pub async fn stream_reply(
        &self,
        history: &[ChatMessage],
        sender: mpsc::Sender<ChatEvent>,
        cancel: &CancelHandle,
    ) -> Result<String, AssistantError> {
        let result = self.relay_stream(history, &sender, cancel).await;
        if let Err(err) = &result {
            let _ = sender.send(ChatEvent::Error(err.to_string())).await;
        }
        result
    }

    async fn relay_stream(
        &self,
        history: &[ChatMessage],
        sender: &mpsc::Sender<ChatEvent>,
        cancel: &CancelHandle,
    ) -> Result<String, AssistantError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(AssistantError::MissingApiKey)?;

        let request = CompletionRequest {
            model: &self.config.model,
            messages: self.request_messages(history),
            stream: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        tracing::debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            "starting chat completion stream"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| AssistantError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "chat completion request failed");
            return Err(AssistantError::Api { status: status.as_u16(), body });
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut reply = String::new();
        let mut finished = false;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(received = reply.len(), "chat stream cancelled");
                    return Err(AssistantError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };

            let chunk = chunk.map_err(|err| AssistantError::Network(err.to_string()))?;
            for frame in decoder.push(&chunk)? {
                finished |= forward(frame, &mut reply, sender).await?;
            }
            if finished {
                break;
            }
        }

        if !finished {
            if let Some(frame) = decoder.finish()? {
                forward(frame, &mut reply, sender).await?;
            }
        }
        if cancel.is_cancelled() {
            return Err(AssistantError::Cancelled);
        }

        tracing::debug!(reply_length = reply.len(), "chat completion stream finished");
        sender
            .send(ChatEvent::Done { reply: reply.clone() })
            .await
            .map_err(|_| AssistantError::Cancelled)?;
        Ok(reply)
    }
}

/// Returns `true` once the terminating frame is seen.
async fn forward(
    frame: SseFrame,
    reply: &mut String,
    sender: &mpsc::Sender<ChatEvent>,
) -> Result<bool, AssistantError> {
    match frame {
        SseFrame::Delta(text) => {
            reply.push_str(&text);
            sender.send(ChatEvent::Delta(text)).await.map_err(|_| AssistantError::Cancelled)?;
            Ok(false)
        }
        SseFrame::Done => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_line(content: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n")
    }

    // Test IDs: TSSE-001
    #[test]
    fn decoder_reassembles_lines_split_across_chunks() -> Result<(), AssistantError> {
        let stream = format!("{}{}data: [DONE]\n\n", delta_line("Restart "), delta_line("the spooler"));
        let (head, tail) = stream.split_at(17);

        let mut decoder = SseDecoder::default();
        let mut frames = decoder.push(head.as_bytes())?;
        assert!(frames.is_empty());
        frames.extend(decoder.push(tail.as_bytes())?);

        assert_eq!(
            frames,
            vec![
                SseFrame::Delta("Restart ".to_string()),
                SseFrame::Delta("the spooler".to_string()),
                SseFrame::Done,
            ]
        );
        Ok(())
    }

    // Test IDs: TSSE-002
    #[test]
    fn decoder_skips_role_only_chunks_comments_and_empty_content() -> Result<(), AssistantError> {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(
            b": keep-alive\n\
              data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\
              data: {\"choices\":[]}\n\
              event: ping\n\n",
        )?;
        assert!(frames.is_empty());
        Ok(())
    }

    // Test IDs: TSSE-003
    #[test]
    fn decoder_flushes_trailing_line_without_newline() -> Result<(), AssistantError> {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: [DONE]")?.is_empty());
        assert_eq!(decoder.finish()?, Some(SseFrame::Done));
        assert_eq!(decoder.finish()?, None);
        Ok(())
    }

    // Test IDs: TSSE-004
    #[test]
    fn decoder_rejects_malformed_payloads() {
        let mut decoder = SseDecoder::default();
        let result = decoder.push(b"data: {not json}\n");
        assert!(matches!(result, Err(AssistantError::Decode(_))));
    }

    // Test IDs: TASST-001
    #[test]
    fn request_messages_prepend_the_configured_system_prompt() -> Result<(), AssistantError> {
        let assistant = ChatAssistant::new(AssistantConfig::default())?;
        let messages = assistant.request_messages(&[
            ChatMessage::system("stale prompt"),
            ChatMessage::user("VPN drops every hour"),
        ]);

        assert_eq!(
            messages,
            vec![ChatMessage::system(IT_EXPERT_SYSTEM_PROMPT), ChatMessage::user("VPN drops every hour")]
        );
        Ok(())
    }

    // Test IDs: TASST-002
    #[test]
    fn cancel_handle_is_shared_between_clones() {
        let handle = CancelHandle::new();
        let observer = handle.clone();
        assert!(!observer.is_cancelled());
        handle.cancel();
        assert!(observer.is_cancelled());
    }
}
