//! Chat-completion streaming against OpenAI-compatible endpoints.
//!
//! Both the site generator (Hugging Face inference router, per-provider) and
//! the coaching assistant (DeepSeek) speak the same SSE protocol, so one
//! client serves both.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

pub const GENERATION_MODEL: &str = "deepseek-ai/DeepSeek-V3-0324";
pub const ASSISTANT_MODEL: &str = "deepseek-chat";
const CLOSE_TAG: &str = "</html>";

pub const GENERATION_SYSTEM_PROMPT: &str = "ONLY USE HTML, CSS AND JAVASCRIPT. If you want to use ICON make sure to import the library first. Try to create the best UI possible by using only HTML, CSS and JAVASCRIPT. Use as much as you can TailwindCSS for the CSS, if you can't do something with TailwindCSS, then use custom CSS (make sure to import <script src=\"https://cdn.tailwindcss.com\"></script> in the head). Also, try to ellaborate as much as you can, to create something unique. ALWAYS GIVE THE RESPONSE INTO A SINGLE HTML FILE";

pub const ASSISTANT_SYSTEM_PROMPT: &str = "You are an expert web development coach and mentor specializing in HTML, CSS, and JavaScript.
Your role is to guide developers by providing helpful explanations, suggestions, and best practices.
Always respond in a conversational, supportive tone. Structure your responses like this:

1. First, acknowledge the developer's request and provide context about what you'll help with
2. Explain your suggested approach and why it's beneficial
3. Provide code examples when relevant, but always explain what the code does
4. Offer additional tips or alternatives when appropriate
5. End with an encouraging note or question to continue the conversation

Remember to focus on teaching and explaining rather than just providing code solutions.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant", content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<usize>,
}

/// Conversation for a generation request: system prompt, optional previous
/// prompt, optional current code, then the new prompt.
pub fn generation_messages(prompt: &str, previous_prompt: Option<&str>, html: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(GENERATION_SYSTEM_PROMPT)];
    if let Some(previous) = previous_prompt.filter(|p| !p.is_empty()) {
        messages.push(ChatMessage::user(previous));
    }
    if let Some(html) = html.filter(|h| !h.is_empty()) {
        messages.push(ChatMessage::assistant(format!("The current code is: {html}.")));
    }
    messages.push(ChatMessage::user(prompt));
    messages
}

/// Conversation for the coaching assistant. Feedback on a previous answer is
/// folded into the system prompt when both are present.
pub fn assistant_messages(
    prompt: &str,
    html: &str,
    feedback: Option<&str>,
    previous_solution: Option<&str>,
) -> Vec<ChatMessage> {
    let mut system = ASSISTANT_SYSTEM_PROMPT.to_string();
    if let (Some(feedback), Some(previous)) = (
        feedback.filter(|f| !f.is_empty()),
        previous_solution.filter(|p| !p.is_empty()),
    ) {
        system.push_str(&format!(
            "\nThe developer previously received this solution:\n```\n{previous}\n```\n\nAnd provided this feedback:\n\"{feedback}\"\n\nPlease take this feedback into account when generating your new response."
        ));
    }

    let user = format!(
        "Current HTML code:\n```html\n{html}\n```\n\nDeveloper's request: {prompt}\n\nProvide a helpful, conversational response that guides the developer. Include explanations, suggestions, and code examples where appropriate."
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub type TextStream = Pin<Box<dyn Stream<Item = AppResult<String>> + Send>>;

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Start a completion and stream its content deltas.
    async fn stream_chat(&self, request: ChatRequest) -> AppResult<TextStream>;
}

/// OpenAI-compatible `/chat/completions` client over server-sent events.
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    url: String,
}

impl ChatCompletionsClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl InferenceClient for ChatCompletionsClient {
    async fn stream_chat(&self, request: ChatRequest) -> AppResult<TextStream> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }

        let builder = self
            .http
            .post(&self.url)
            .bearer_auth(&request.api_key)
            .json(&body);

        let mut es = builder
            .eventsource()
            .map_err(|e| AppError::Internal(format!("Failed to create event source: {e}")))?;

        // The event source connects lazily; wait for the response so that an
        // unreachable or rejecting upstream fails the request instead of the body.
        match es.next().await {
            Some(Ok(Event::Open)) => debug!("SSE connection opened"),
            Some(Ok(Event::Message(msg))) => {
                es.close();
                return Err(AppError::Upstream(format!("Unexpected event before open: {}", msg.event)));
            }
            Some(Err(err)) => {
                es.close();
                return Err(upstream_error(err));
            }
            None => return Err(AppError::Upstream("Event source closed before opening".into())),
        }

        let stream = futures::stream::unfold(es, |mut es| async move {
            loop {
                match es.next().await? {
                    Ok(Event::Open) => debug!("SSE connection reopened"),
                    Ok(Event::Message(msg)) => {
                        if msg.data.trim() == "[DONE]" {
                            es.close();
                            return None;
                        }
                        if let Some(text) = parse_delta_text(&msg.data) {
                            return Some((Ok(text), es));
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => {
                        es.close();
                        return None;
                    }
                    Err(err) => {
                        warn!(?err, "SSE stream error");
                        es.close();
                        return Some((Err(upstream_error(err)), es));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

fn upstream_error(err: reqwest_eventsource::Error) -> AppError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => {
            AppError::Upstream(format!("Inference provider answered {status}"))
        }
        other => AppError::Upstream(other.to_string()),
    }
}

/// Content of `choices[0].delta.content`, if non-empty.
pub fn parse_delta_text(data: &str) -> Option<String> {
    let v: Value = serde_json::from_str(data).ok()?;
    v["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Stops a generation stream at the first `</html>`, dropping whatever the
/// model appends after the document.
#[derive(Debug, Default)]
pub struct HtmlCutoff {
    seen: String,
    done: bool,
}

impl HtmlCutoff {
    /// Text to forward for `chunk`, or `None` once the document has closed.
    pub fn feed(&mut self, chunk: &str) -> Option<String> {
        if self.done {
            return None;
        }
        let before = self.seen.len();
        self.seen.push_str(chunk);

        let mut from = before.saturating_sub(CLOSE_TAG.len() - 1);
        while !self.seen.is_char_boundary(from) {
            from -= 1;
        }
        match self.seen[from..].find(CLOSE_TAG) {
            Some(pos) => {
                let end = from + pos + CLOSE_TAG.len();
                self.done = true;
                Some(self.seen[before..end].to_string())
            }
            None => Some(chunk.to_string()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Body chunks travel from the upstream reader task to the response.
pub type BodyReceiver = mpsc::Receiver<AppResult<String>>;

/// Pump `upstream` into a bounded channel from a spawned task. With `cut_at_html`
/// the pump stops after the document's closing tag. The task ends when the
/// client goes away.
pub fn spawn_pump(mut upstream: TextStream, cut_at_html: bool) -> BodyReceiver {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut cutoff = HtmlCutoff::default();
        while let Some(item) = upstream.next().await {
            let item = match item {
                Ok(chunk) if cut_at_html => match cutoff.feed(&chunk) {
                    Some(text) => Ok(text),
                    None => break,
                },
                other => other,
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                debug!("client went away, dropping upstream stream");
                return;
            }
            if failed || cutoff.is_done() {
                break;
            }
        }
    });
    rx
}

/// Adapt a channel receiver into a stream usable as a response body.
pub fn receiver_stream(rx: BodyReceiver) -> impl Stream<Item = AppResult<String>> + Send {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}
