use crate::ai::{
    AiClassifier, CategoryAliasRequest, CategoryAliasResponse, ColumnClassificationRequest,
    ColumnClassificationResponse,
};
use crate::error::Result;
use crate::llm::client::{clean_json_output, response_schema, GeminiClient, DEFAULT_MODEL};
use crate::llm::prompts::{SYSTEM_PROMPT_CATEGORIES, SYSTEM_PROMPT_COLUMNS};
use crate::llm::types::Content;
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;

/// [`AiClassifier`] backed by Gemini structured output.
pub struct GeminiClassifier {
    client: GeminiClient,
    model: String,
}

impl GeminiClassifier {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(GeminiClient::from_env()?, model))
    }

    async fn ask<T: DeserializeOwned + schemars::JsonSchema>(
        &self,
        system_prompt: &str,
        user_message: String,
    ) -> Result<T> {
        let raw = self
            .client
            .generate_content(
                &self.model,
                system_prompt,
                vec![Content::user(user_message)],
                Some(response_schema::<T>()),
            )
            .await?;
        debug!("Gemini replied with {} bytes", raw.len());
        Ok(serde_json::from_str(&clean_json_output(&raw))?)
    }
}

fn column_message(request: &ColumnClassificationRequest) -> String {
    let mut message = String::from("Classify these spreadsheet columns.\n\n");
    for column in &request.columns {
        message.push_str(&format!(
            "- \"{}\": samples [{}]\n",
            column.header,
            column.samples.join(", ")
        ));
    }
    let fields: Vec<&str> = request.candidate_fields.iter().map(|f| f.as_tag()).collect();
    message.push_str(&format!("\nAllowed fields: {}\n", fields.join(", ")));
    message
}

fn category_message(request: &CategoryAliasRequest) -> String {
    let mut message = format!(
        "Contract categories: {}\n\nReport categories:\n",
        request.contract_categories.join(", ")
    );
    for category in &request.report_categories {
        message.push_str(&format!("- \"{}\"\n", category));
    }
    if let Some(hint) = &request.hint_text {
        message.push_str(&format!("\nNotes found in the report:\n{}\n", hint));
    }
    message
}

#[async_trait]
impl AiClassifier for GeminiClassifier {
    async fn classify_columns(
        &self,
        request: &ColumnClassificationRequest,
    ) -> Result<ColumnClassificationResponse> {
        self.ask(SYSTEM_PROMPT_COLUMNS, column_message(request)).await
    }

    async fn resolve_category_aliases(
        &self,
        request: &CategoryAliasRequest,
    ) -> Result<CategoryAliasResponse> {
        self.ask(SYSTEM_PROMPT_CATEGORIES, category_message(request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ColumnSample;
    use crate::schema::SemanticField;

    #[test]
    fn test_messages_list_every_input() {
        let request = ColumnClassificationRequest {
            columns: vec![ColumnSample {
                header: "Amt Owed".to_string(),
                samples: vec!["6384.00".to_string()],
            }],
            candidate_fields: SemanticField::ALL.to_vec(),
        };
        let message = column_message(&request);
        assert!(message.contains("\"Amt Owed\": samples [6384.00]"));
        assert!(message.contains("licensee_reported_royalty"));

        let request = CategoryAliasRequest {
            report_categories: vec!["Tops & Bottoms".to_string()],
            contract_categories: vec!["Apparel".to_string(), "Footwear".to_string()],
            hint_text: Some("All tops are apparel".to_string()),
        };
        let message = category_message(&request);
        assert!(message.contains("Contract categories: Apparel, Footwear"));
        assert!(message.contains("All tops are apparel"));
    }
}
