use crate::error::{Result, RoyaltyError};
use crate::llm::types::*;
use reqwest::Client;
use schemars::r#gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::Value;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    /// Reads `GEMINI_API_KEY` from the environment.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| {
            RoyaltyError::ClassifierFailed("GEMINI_API_KEY is not set".to_string())
        })?;
        Ok(Self::new(api_key))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub(crate) async fn generate_content(
        &self,
        model: &str,
        system_prompt: &str,
        messages: Vec<Content>,
        response_schema: Option<Value>,
    ) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        let payload = GenerateContentRequest {
            contents: messages,
            system_instruction: Some(Content::user(system_prompt)),
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema,
                temperature: 0.0,
            },
        };

        let res = self.client.post(&url).json(&payload).send().await?;
        let status = res.status();

        if !status.is_success() {
            let err_text = res.text().await?;
            return Err(RoyaltyError::ClassifierFailed(format!(
                "Gemini API Error (status {}): {}",
                status, err_text
            )));
        }

        let body: GenerateContentResponse = res.json().await?;

        body.candidates
            .ok_or_else(|| RoyaltyError::ClassifierFailed("No candidates returned".to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| RoyaltyError::ClassifierFailed("Empty candidates list".to_string()))?
            .content
            .parts
            .into_iter()
            .next()
            .map(|part| part.text)
            .ok_or_else(|| RoyaltyError::ClassifierFailed("No parts in content".to_string()))
    }
}

/// JSON schema for `T` in the OpenAPI subset Gemini accepts as `responseSchema`.
pub fn response_schema<T: JsonSchema>() -> Value {
    let root = SchemaSettings::openapi3()
        .with(|s| s.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<T>();
    let mut value = serde_json::to_value(root.schema).unwrap_or(Value::Null);
    strip_unsupported(&mut value);
    value
}

fn strip_unsupported(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in ["$schema", "title", "definitions", "additionalProperties"] {
                map.remove(key);
            }
            map.values_mut().for_each(strip_unsupported);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_unsupported),
        _ => {}
    }
}

/// Pulls the JSON object out of a reply that may carry a code fence or prose.
pub fn clean_json_output(raw: &str) -> String {
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            return raw[start..=end].to_string();
        }
    }
    raw.trim().to_string()
}
