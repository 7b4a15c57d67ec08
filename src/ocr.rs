//! Image OCR via a vision LLM
//!
//! Asks the model to transcribe any text in the image, or to describe the
//! scene in one paragraph when there is none, so the image is retrievable
//! either way. The raw model output is normalised: repeated sentences and
//! "no text" disclaimers collapse to a single clean paragraph. Degenerate
//! output triggers one retry with a pure-description prompt; if that also
//! fails, a placeholder keeps the image indexed.

use crate::config::OcrConfig;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Placeholder used when the model cannot produce anything useful
pub const FALLBACK_DESCRIPTION: &str = "图片内容描述：纯图无文字，请根据视觉信息检索。";

const OCR_PROMPT: &str = "请根据图片内容完成以下其一（只输出结果，不要解释）：\n\
1. 若图中有文字：提取图中全部文字，并简要说明文字所在位置或含义。\n\
2. 若图中没有文字：用一段话描述图片（场景、主体、颜色、风格等），便于后续检索。\n\
要求：只输出一段文字，不要重复同一段内容，不要输出「图中没有文字」等无效句。";

const DESCRIBE_PROMPT: &str =
    "请用一句话描述这张图片的内容（场景、主体、颜色等），用于检索。不要重复句子。";

/// Turns image bytes into retrievable text
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Extract text or a scene description. Never fails hard: provider
    /// errors yield an empty string and the caller skips the file.
    async fn extract_text_from_image(&self, bytes: &[u8], format: &str) -> String;
}

/// HTTP client for an OpenAI-compatible vision chat endpoint
pub struct HttpOcr {
    client: reqwest::Client,
    config: OcrConfig,
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

fn mime_for_ext(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "png" => "image/png",
        _ => "image/jpeg",
    }
}

impl HttpOcr {
    pub fn new(config: OcrConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to create HTTP client");
        Self { client, config }
    }

    async fn vision_call(&self, data_url: &str, prompt: &str) -> reqwest::Result<String> {
        let body = json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image_url", "image_url": { "url": data_url } },
                    { "type": "text", "text": prompt },
                ],
            }],
        });
        let response = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: ChatResponse = response.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[async_trait]
impl OcrEngine for HttpOcr {
    async fn extract_text_from_image(&self, bytes: &[u8], format: &str) -> String {
        if bytes.is_empty() {
            return String::new();
        }
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        let data_url = format!("data:{};base64,{}", mime_for_ext(format), b64);

        let raw = match self.vision_call(&data_url, OCR_PROMPT).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("image OCR failed: {}", e);
                return String::new();
            }
        };
        debug!("OCR first pass returned {} chars", raw.chars().count());

        let normalised = normalize_description(&raw);
        if !normalised.is_empty() && !is_degenerate(&normalised) {
            return normalised;
        }

        // Second pass: force a scene description
        let retry = match self.vision_call(&data_url, DESCRIBE_PROMPT).await {
            Ok(retry) => retry,
            Err(e) => {
                warn!("OCR description retry failed: {}", e);
                return FALLBACK_DESCRIPTION.to_string();
            }
        };
        let normalised = normalize_description(&retry);
        if normalised.is_empty() || is_degenerate(&normalised) {
            FALLBACK_DESCRIPTION.to_string()
        } else {
            normalised
        }
    }
}

const NO_TEXT_MARKERS: &[&str] = &[
    "没有文字",
    "无文字",
    "图中没有",
    "图片中没有",
    "无文字内容",
    "不含文字",
];

const DESCRIPTION_MARKERS: &[&str] = &["「图片内容描述：」", "图片内容描述："];

/// Degenerate output: empty, a bare "0", or a very short digit string
pub fn is_degenerate(text: &str) -> bool {
    let trimmed = text.trim().trim_end_matches('。');
    trimmed.is_empty() || (trimmed.chars().count() <= 3 && trimmed.chars().all(|c| c.is_ascii_digit()))
}

/// Collapse the model's repetitions into a single clean paragraph ending
/// with a terminator. Short "no text" disclaimers become empty so the
/// caller can retry.
pub fn normalize_description(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    if text.is_empty() {
        return String::new();
    }

    // A short disclaimer-only answer is useless for retrieval
    if NO_TEXT_MARKERS.iter().any(|marker| text.contains(marker)) && text.chars().count() < 80 {
        return String::new();
    }

    // The same description-marker paragraph repeated inline: keep the first
    for marker in DESCRIPTION_MARKERS {
        if let Some(first) = text.find(marker) {
            if let Some(second) = text[first + marker.len()..].find(marker) {
                let cut = first + marker.len() + second;
                text = text[..cut].trim_end().trim_end_matches('。').to_string();
                text.push('。');
                break;
            }
        }
    }

    // Every line starts with the marker: keep the first line
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.len() >= 2 {
        for marker in DESCRIPTION_MARKERS {
            if lines.iter().all(|line| line.starts_with(marker)) {
                return lines[0].to_string();
            }
        }
    }

    // Sentence-level dedup
    let parts: Vec<&str> = text
        .split(['。', '！', '？'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return text;
    }
    let mut unique: Vec<&str> = Vec::new();
    for part in parts {
        if !unique.contains(&part) {
            unique.push(part);
        }
    }
    let mut joined = unique.join("。");
    if !joined.ends_with('。') {
        joined.push('。');
    }
    joined
}
