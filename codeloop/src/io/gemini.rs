//! Gemini `generateContent` backend over a blocking HTTP client.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::io::generator::Generator;
use crate::io::process::Cancelled;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_OUTPUT_TOKENS: u32 = 8192;

/// Explicit provider configuration; nothing is read from the environment here.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub timeout: Duration,
}

pub struct GeminiGenerator {
    client: Client,
    config: GeminiConfig,
}

impl GeminiGenerator {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetails {
    code: u16,
    message: String,
}

fn build_request(prompt: &str, temperature: f32) -> GeminiRequest {
    GeminiRequest {
        contents: vec![GeminiContent {
            role: Some("user".to_string()),
            parts: vec![GeminiPart {
                text: Some(prompt.to_string()),
            }],
        }],
        generation_config: GeminiGenerationConfig {
            temperature,
            max_output_tokens: MAX_OUTPUT_TOKENS,
        },
    }
}

/// Concatenate the text parts of the first candidate.
fn parse_response(body: &str) -> Result<String> {
    let response: GeminiResponse =
        serde_json::from_str(body).context("parse Gemini response")?;
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no candidates in Gemini response"))?;
    let text: String = candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .collect();
    if text.trim().is_empty() {
        return Err(anyhow!(
            "empty Gemini response (finish reason {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        ));
    }
    Ok(text)
}

fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<GeminiError>(body) {
        Ok(err) => format!("Gemini API error {}: {}", err.error.code, err.error.message),
        Err(_) => format!("Gemini API request failed with status {status}: {}", body.trim()),
    }
}

impl Generator for GeminiGenerator {
    #[instrument(skip_all, fields(model = %self.config.model, prompt_bytes = prompt.len()))]
    fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let request = build_request(prompt, self.config.temperature);
        let builder = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request);

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = builder.send().and_then(|response| {
                let status = response.status();
                response.text().map(|body| (status, body))
            });
            // After cancellation the receiver is gone; the late result is dropped on purpose.
            if tx.send(result).is_err() {
                debug!("Gemini response arrived after cancellation, discarding");
            }
        });

        let (status, body) = loop {
            if cancel.is_cancelled() {
                warn!("generation cancelled, abandoning request");
                return Err(Cancelled.into());
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(result) => break result.context("Gemini API request failed")?,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("Gemini request thread exited without a result"));
                }
            }
        };

        if !status.is_success() {
            return Err(anyhow!(error_message(status, &body)));
        }
        let text = parse_response(&body)?;
        debug!(response_bytes = text.len(), "Gemini response received");
        Ok(text)
    }
}
