use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::adapter::ImageAdapter;
use crate::capability::CapabilityProfile;
use crate::types::{GenerationRequest, ImageResult};
use crate::Result;
use crate::utils::http::{RetryPolicy, send_checked_json_with_retry};

/// Adapter for REST `images/generations` providers. The same adapter serves
/// both the single-image-per-call and the batch-capable providers; the
/// scheduler picks `count` per the capability profile.
#[derive(Clone)]
pub struct RestImages {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    provider_id: String,
    model: String,
    retry: RetryPolicy,
}

impl RestImages {
    pub fn new(provider_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("reqwest client build should not fail");

        let provider_id = provider_id.into();
        let api_key = api_key.into();
        Self {
            http,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: (!api_key.trim().is_empty()).then_some(api_key),
            model: provider_id.clone(),
            provider_id,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn images_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/images/generations") {
            base.to_string()
        } else {
            format!("{base}/images/generations")
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn build_body(
        &self,
        request: &GenerationRequest,
        profile: &CapabilityProfile,
        count: u32,
    ) -> Map<String, Value> {
        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert("prompt".to_string(), Value::String(request.prompt.clone()));
        body.insert("n".to_string(), Value::Number(count.into()));

        let size = request
            .options
            .size
            .as_deref()
            .unwrap_or(profile.default_size.as_str());
        body.insert("size".to_string(), Value::String(size.to_string()));

        let options = &request.options;
        if let Some(quality) = options.quality.as_deref() {
            body.insert("quality".to_string(), Value::String(quality.to_string()));
        }
        if let Some(style) = options.style.as_deref() {
            body.insert("style".to_string(), Value::String(style.to_string()));
        }
        if let Some(background) = options.background.as_deref() {
            body.insert(
                "background".to_string(),
                Value::String(background.to_string()),
            );
        }
        if let Some(format) = options.output_format.as_deref() {
            body.insert(
                "output_format".to_string(),
                Value::String(format.to_string()),
            );
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ImagesGenerationResponse {
    #[serde(default)]
    data: Vec<ImageGenerationData>,
}

#[derive(Debug, Deserialize)]
struct ImageGenerationData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

#[async_trait]
impl ImageAdapter for RestImages {
    fn provider(&self) -> &str {
        self.provider_id.as_str()
    }

    async fn invoke(
        &self,
        request: &GenerationRequest,
        profile: &CapabilityProfile,
        count: u32,
    ) -> Result<Vec<ImageResult>> {
        let body = self.build_body(request, profile, count);
        let req = self.apply_auth(self.http.post(self.images_url())).json(&body);
        let parsed: ImagesGenerationResponse =
            send_checked_json_with_retry(req, &self.retry).await?;

        let mime_hint = request
            .options
            .output_format
            .as_deref()
            .map(|format| format!("image/{format}"))
            .unwrap_or_else(|| "image/png".to_string());

        let mut images = Vec::<ImageResult>::new();
        for item in parsed.data {
            let revised = item
                .revised_prompt
                .as_deref()
                .filter(|v| !v.trim().is_empty());

            if let Some(url) = item.url.as_deref().filter(|v| !v.trim().is_empty()) {
                let mut result = ImageResult::remote_url(url);
                if let Some(prompt) = revised {
                    result = result.with_revised_prompt(prompt);
                }
                images.push(result);
                continue;
            }
            if let Some(data) = item.b64_json.as_deref().filter(|v| !v.trim().is_empty()) {
                // One undecodable entry must not discard its siblings; the
                // short slot surfaces as a per-item error downstream.
                let decoded = match BASE64.decode(data) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        tracing::warn!(provider = %self.provider_id, error = %err, "skipping undecodable b64_json payload");
                        continue;
                    }
                };
                let mut result = ImageResult::inline(Bytes::from(decoded), mime_hint.clone());
                if let Some(prompt) = revised {
                    result = result.with_revised_prompt(prompt);
                }
                images.push(result);
                continue;
            }
            tracing::warn!(provider = %self.provider_id, "image item is missing both url and b64_json");
        }

        // A short or empty list is reported as-is; the scheduler treats the
        // returned count as authoritative and marks unmatched slots.
        Ok(images)
    }
}
