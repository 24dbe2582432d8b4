//! Chat-model backends over OpenAI-compatible servers.
//!
//! LM Studio and OpenAI both speak the chat-completions protocol, so one
//! client covers the configured `llm_backend` selectors. Vision-capable
//! models receive images as base64 data URLs inside the user message.
//! Streaming is a lazy iterator over content chunks in model emission
//! order; dropping it cancels the request and never touches the store.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use super::{Backend, Capabilities};
use crate::config::Config;
use crate::error::{RecallError, Result};

/// Room reserved inside the context window for the prompt scaffold and the
/// model's response.
const RESPONSE_HEADROOM_TOKENS: usize = 512;

/// Fallback truncation when tokenization itself fails.
const FALLBACK_TRUNCATION_CHARS: usize = 10_000;

/// Chat backend surface.
pub trait LlmBackend: Backend {
    /// One-shot completion. `image_paths` are indexed documents shown to a
    /// vision model; `attached_image` is an ad-hoc image attached to a chat
    /// query. Both end up as image parts of the user message.
    fn invoke(
        &self,
        prompt: &str,
        image_paths: &[String],
        attached_image: Option<&Path>,
        temperature: f32,
    ) -> Result<String>;

    /// Streaming completion: a lazy finite sequence of content chunks.
    fn stream(
        &self,
        prompt: &str,
        image_paths: &[String],
        attached_image: Option<&Path>,
        temperature: f32,
    ) -> Result<TokenStream>;

    fn vision(&self) -> bool {
        self.capabilities().vision
    }
}

/// Lazy sequence of streamed content chunks. Dropping it cancels the
/// underlying request.
pub struct TokenStream {
    inner: Box<dyn Iterator<Item = Result<String>> + Send>,
}

impl TokenStream {
    pub fn from_chunks(chunks: Vec<String>) -> Self {
        Self {
            inner: Box::new(chunks.into_iter().map(Ok)),
        }
    }

    /// Drain the stream into the full response text.
    pub fn collect_text(self) -> Result<String> {
        let mut text = String::new();
        for chunk in self {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Iterator for TokenStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Client for any OpenAI-compatible chat-completions server.
pub struct OpenAiCompatibleLlm {
    backend_label: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
    vision: bool,
    loaded: AtomicBool,
    client: reqwest::blocking::Client,
}

impl OpenAiCompatibleLlm {
    pub fn new(
        backend_label: &str,
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        system_prompt: &str,
        vision: bool,
    ) -> Self {
        Self {
            backend_label: backend_label.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            vision,
            loaded: AtomicBool::new(false),
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(240))
                .build()
                .expect("reqwest client"),
        }
    }

    /// Local LM Studio server (no auth).
    pub fn lmstudio(config: &Config) -> Self {
        Self::new(
            "lmstudio",
            &config.lms_base_url,
            None,
            &config.lms_model_name,
            &config.llm_system_prompt,
            true,
        )
    }

    /// Hosted OpenAI API; the key comes from `OPENAI_API_KEY`.
    pub fn openai(config: &Config) -> Self {
        Self::new(
            "openai",
            "https://api.openai.com/v1",
            std::env::var("OPENAI_API_KEY").ok(),
            &config.openai_model_name,
            &config.llm_system_prompt,
            true,
        )
    }

    /// Pick the chat backend from the config selector string.
    pub fn from_config(config: &Config) -> Self {
        match config.llm_backend.to_lowercase().replace(' ', "").as_str() {
            "openai" => Self::openai(config),
            "lmstudio" => Self::lmstudio(config),
            other => {
                warn!("Unknown llm_backend {other:?}, using lmstudio");
                Self::lmstudio(config)
            }
        }
    }

    fn request(&self, body: &Value) -> Result<reqwest::blocking::Response> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|e| RecallError::backend(format!("{} request failed: {e}", self.backend_label)))?;
        if !response.status().is_success() {
            return Err(RecallError::backend(format!(
                "{} returned {}",
                self.backend_label,
                response.status()
            )));
        }
        Ok(response)
    }

    fn build_body(
        &self,
        prompt: &str,
        image_paths: &[String],
        attached_image: Option<&Path>,
        temperature: f32,
        stream: bool,
    ) -> Result<Value> {
        let mut messages = Vec::new();
        if !self.system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": self.system_prompt }));
        }

        let mut images: Vec<&Path> = image_paths.iter().map(Path::new).collect();
        if let Some(attached) = attached_image {
            images.push(attached);
        }

        if images.is_empty() {
            messages.push(json!({ "role": "user", "content": prompt }));
        } else {
            if !self.vision {
                return Err(RecallError::backend(format!(
                    "{} has no vision support but received image input",
                    self.backend_label
                )));
            }
            let mut parts = vec![json!({ "type": "text", "text": prompt })];
            for image in images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": image_data_url(image)? }
                }));
            }
            messages.push(json!({ "role": "user", "content": parts }));
        }

        Ok(json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
        }))
    }
}

impl Backend for OpenAiCompatibleLlm {
    /// Verifies the server answers `/models` and flips the availability
    /// flag. Idempotent; safe to call from a toggle handler.
    fn load(&self) -> bool {
        if self.loaded.load(Ordering::SeqCst) {
            return true;
        }
        if self.api_key.is_none() && self.backend_label == "openai" {
            error!("OPENAI_API_KEY not set, cannot load openai backend");
            return false;
        }
        let mut request = self.client.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        match request.timeout(Duration::from_secs(5)).send() {
            Ok(response) if response.status().is_success() => {
                info!("{} backend online ({})", self.backend_label, self.model);
                self.loaded.store(true, Ordering::SeqCst);
                true
            }
            Ok(response) => {
                error!("{} /models returned {}", self.backend_label, response.status());
                false
            }
            Err(e) => {
                error!("{} unreachable: {e}", self.backend_label);
                false
            }
        }
    }

    fn unload(&self) {
        self.loaded.store(false, Ordering::SeqCst);
    }

    fn loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            vision: self.vision,
            ..Default::default()
        }
    }
}

impl LlmBackend for OpenAiCompatibleLlm {
    fn invoke(
        &self,
        prompt: &str,
        image_paths: &[String],
        attached_image: Option<&Path>,
        temperature: f32,
    ) -> Result<String> {
        if !self.loaded() {
            return Err(RecallError::unavailable("llm"));
        }
        let body = self.build_body(prompt, image_paths, attached_image, temperature, false)?;
        let response: Value = self
            .request(&body)?
            .json()
            .map_err(|e| RecallError::backend(format!("malformed completion response: {e}")))?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| RecallError::backend("completion response had no content"))
    }

    fn stream(
        &self,
        prompt: &str,
        image_paths: &[String],
        attached_image: Option<&Path>,
        temperature: f32,
    ) -> Result<TokenStream> {
        if !self.loaded() {
            return Err(RecallError::unavailable("llm"));
        }
        let body = self.build_body(prompt, image_paths, attached_image, temperature, true)?;
        let response = self.request(&body)?;
        let reader = BufReader::new(response);

        let iter = reader
            .lines()
            .filter_map(|line| match line {
                Ok(line) => {
                    let data = line.strip_prefix("data: ")?;
                    if data == "[DONE]" {
                        return None;
                    }
                    let value: Value = serde_json::from_str(data).ok()?;
                    let chunk = value["choices"][0]["delta"]["content"].as_str()?;
                    if chunk.is_empty() {
                        None
                    } else {
                        Some(Ok(chunk.to_string()))
                    }
                }
                Err(e) => Some(Err(RecallError::backend(format!("stream read failed: {e}")))),
            })
            // A read error ends the stream after being reported once
            .scan(false, |failed, item| {
                if *failed {
                    return None;
                }
                *failed = item.is_err();
                Some(item)
            });

        Ok(TokenStream {
            inner: Box::new(iter),
        })
    }
}

fn image_data_url(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).map_err(|e| RecallError::io(path, format!("read failed: {e}")))?;
    let mime = match crate::utils::dot_extension(path).as_str() {
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".webp" => "image/webp",
        ".bmp" => "image/bmp",
        _ => "image/png",
    };
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

// --- indexing prompts ---

const INDEXING_INSTRUCTION: &str = "for a search engine index by generating a direct, factual \
description of the context, followed immediately by a comprehensive list of relevant search \
keywords, synonyms, and entities. Keep the description dry and robotic, avoiding flowery \
language or meta-phrases like 'this image depicts,' and instead focus strictly on visible \
objects, actions, and specific data. Output only the plain text result consisting of the \
factual description followed by the comma-separated keyword list. Make your response 250 \
words or less.";

pub fn indexing_prompt_for_image(filename: &str) -> String {
    format!("Analyze this image {INDEXING_INSTRUCTION}\n\nFilename: {filename}")
}

pub fn indexing_prompt_for_text(filename: &str, content: &str) -> String {
    format!("Analyze this document {INDEXING_INSTRUCTION}\n\nFilename: {filename}. Content: {content}")
}

/// Trim document text to fit the chat context window, leaving headroom for
/// the prompt scaffold and the response.
pub fn budget_text(text: &str, context_length: usize) -> String {
    let budget = context_length.saturating_sub(RESPONSE_HEADROOM_TOKENS);
    match tiktoken_rs::cl100k_base() {
        Ok(tokenizer) => {
            let tokens = tokenizer.encode_ordinary(text);
            if tokens.len() <= budget {
                return text.to_string();
            }
            match tokenizer.decode(tokens[..budget].to_vec()) {
                Ok(trimmed) => trimmed,
                Err(e) => {
                    warn!("Token decode failed ({e}), truncating by characters");
                    text.chars().take(FALLBACK_TRUNCATION_CHARS).collect()
                }
            }
        }
        Err(e) => {
            warn!("Tokenizer unavailable ({e}), truncating by characters");
            text.chars().take(FALLBACK_TRUNCATION_CHARS).collect()
        }
    }
}
