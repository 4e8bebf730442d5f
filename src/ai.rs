//! AI patch generation
//!
//! The last dispatch tier. A backend receives the failing file split into
//! chunks plus the error text, and answers with a unified diff (possibly
//! wrapped in prose or a fenced block). Applying the answer is the
//! dispatcher's job.

use crate::error::{FixError, FixResult};
use crate::util::truncate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";
const MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT_SECS: u64 = 120;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

const PATCH_SYSTEM: &str = r#"You are fixing a failing Python test. You are given the test file (split into numbered chunks) and the failure message.

Respond with a single unified diff that makes the test pass:
- Use `--- a/<path>` and `+++ b/<path>` headers with the path exactly as given
- Include at least 3 lines of unchanged context around every change
- Line numbers in `@@` headers refer to the whole file, not the chunk
- Change as little as possible; do not reformat unrelated code
- You may patch another file in the project if the bug is there

Output only the diff in a ```diff fenced block. No explanation."#;

/// A contiguous slice of the file sent to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChunk {
    /// 1-based line number of the chunk's first line
    pub start_line: usize,
    pub text: String,
}

impl SourceChunk {
    pub fn end_line(&self) -> usize {
        self.start_line + self.text.lines().count().saturating_sub(1)
    }
}

/// Split `content` into chunks of at most `lines_per_chunk` lines.
pub fn chunk_source(content: &str, lines_per_chunk: usize) -> Vec<SourceChunk> {
    let size = lines_per_chunk.max(1);
    let lines: Vec<&str> = content.lines().collect();
    lines
        .chunks(size)
        .enumerate()
        .map(|(i, group)| SourceChunk {
            start_line: i * size + 1,
            text: group.join("\n"),
        })
        .collect()
}

/// What the dispatcher hands to a backend
#[derive(Debug, Clone, Copy)]
pub struct PatchRequest<'a> {
    /// Path of the failing file as the diff should name it
    pub file: &'a Path,
    pub chunks: &'a [SourceChunk],
    pub error: &'a str,
}

impl PatchRequest<'_> {
    fn user_prompt(&self) -> String {
        let mut prompt = format!(
            "File: {}\nFailure: {}\n",
            self.file.display(),
            self.error
        );
        let total = self.chunks.len();
        for (i, chunk) in self.chunks.iter().enumerate() {
            prompt.push_str(&format!(
                "\nChunk {}/{} (lines {}-{}):\n```python\n{}\n```\n",
                i + 1,
                total,
                chunk.start_line,
                chunk.end_line(),
                chunk.text
            ));
        }
        prompt
    }
}

/// Produces a patch suggestion for a failing file
pub trait AiBackend: Send {
    fn suggest_patch(&self, request: &PatchRequest<'_>) -> FixResult<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Chat-completions backend over OpenRouter.
///
/// The dispatcher is synchronous; requests are driven on the runtime behind
/// `handle`. Must not be called from an async task on that runtime (cycles
/// run under `spawn_blocking`).
pub struct OpenRouterBackend {
    client: reqwest::Client,
    handle: Handle,
    api_key: String,
    model: String,
    url: String,
}

impl OpenRouterBackend {
    pub fn new(handle: Handle, api_key: String, model: impl Into<String>) -> FixResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FixError::Backend(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            handle,
            api_key,
            model: model.into(),
            url: OPENROUTER_URL.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> FixResult<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: MAX_TOKENS,
            stream: false,
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Title", "nightmend")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await
                .map_err(|e| FixError::Backend(format!("request failed: {}", e)))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| FixError::Backend(format!("failed to read response: {}", e)))?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    FixError::Backend(format!(
                        "failed to parse response: {} ({})",
                        e,
                        truncate(&text, 200)
                    ))
                })?;
                return Ok(parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .unwrap_or_default());
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text).unwrap_or(
                    INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1) / 1000,
                );
                warn!(retry_after, retry_count, max = MAX_RETRIES, "rate limited; retrying");
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => "invalid API key".to_string(),
                429 => format!("rate limited after {} retries", retry_count),
                500..=599 => format!("server error ({})", status),
                _ => format!("API error {}: {}", status, truncate(&text, 200)),
            };
            return Err(FixError::Backend(message));
        }
    }
}

impl AiBackend for OpenRouterBackend {
    fn suggest_patch(&self, request: &PatchRequest<'_>) -> FixResult<String> {
        let user = request.user_prompt();
        debug!(
            model = %self.model,
            file = %request.file.display(),
            chunks = request.chunks.len(),
            "requesting AI patch"
        );
        self.handle.block_on(self.complete(PATCH_SYSTEM, &user))
    }
}

/// Seconds hint from a rate-limit body such as "retry after 12 seconds".
fn parse_retry_after(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    let pos = lower.find("retry")?;
    lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}
