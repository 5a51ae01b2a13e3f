//! The AI classifier collaborator: request/response shapes and the trait the
//! pipeline calls through.
//!
//! Both calls are batched (one per upload per concern) and bounded by a
//! timeout. A failure never fails the upload; callers degrade to
//! unresolved columns or categories.

use crate::error::{Result, RoyaltyError};
use crate::schema::SemanticField;
use async_trait::async_trait;
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnSample {
    #[schemars(description = "The column header exactly as it appears in the spreadsheet.")]
    pub header: String,
    #[schemars(description = "A few values from the first data rows of the column.")]
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnClassificationRequest {
    pub columns: Vec<ColumnSample>,
    pub candidate_fields: Vec<SemanticField>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnClassificationResponse {
    #[schemars(description = "One entry per column that was sent for classification.")]
    #[serde(default)]
    pub assignments: Vec<ColumnSuggestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnSuggestion {
    #[schemars(description = "The column header, copied exactly from the request.")]
    pub column: String,
    #[schemars(
        description = "One of: net_sales, gross_sales, returns, product_category, royalty_rate, licensee_reported_royalty, territory, metadata, ignore."
    )]
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAliasRequest {
    pub report_categories: Vec<String>,
    pub contract_categories: Vec<String>,
    pub hint_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CategoryAliasResponse {
    #[serde(default)]
    pub mappings: Vec<CategorySuggestion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CategorySuggestion {
    #[schemars(description = "The category label from the report, copied exactly from the request.")]
    pub report_category: String,
    #[schemars(
        description = "The contract category it belongs to, copied exactly from the contract category list, or null when none fits."
    )]
    pub contract_category: Option<String>,
    #[schemars(description = "Confidence between 0.0 and 1.0.")]
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait AiClassifier: Send + Sync {
    async fn classify_columns(
        &self,
        request: &ColumnClassificationRequest,
    ) -> Result<ColumnClassificationResponse>;

    async fn resolve_category_aliases(
        &self,
        request: &CategoryAliasRequest,
    ) -> Result<CategoryAliasResponse>;
}

/// Used when no AI service is configured: every call degrades immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledClassifier;

#[async_trait]
impl AiClassifier for DisabledClassifier {
    async fn classify_columns(
        &self,
        _request: &ColumnClassificationRequest,
    ) -> Result<ColumnClassificationResponse> {
        Err(RoyaltyError::ClassifierFailed(
            "no AI classifier configured".to_string(),
        ))
    }

    async fn resolve_category_aliases(
        &self,
        _request: &CategoryAliasRequest,
    ) -> Result<CategoryAliasResponse> {
        Err(RoyaltyError::ClassifierFailed(
            "no AI classifier configured".to_string(),
        ))
    }
}

/// Outcome of the AI step, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AiStatus {
    NotNeeded,
    Succeeded,
    Degraded { reason: String },
}

/// Runs an AI call under a timeout, turning any failure into a degrade reason.
pub async fn call_with_timeout<T, F>(
    limit: Duration,
    what: &str,
    call: F,
) -> std::result::Result<T, String>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!("AI {} failed, continuing without it: {}", what, e);
            Err(e.to_string())
        }
        Err(_) => {
            warn!(
                "AI {} timed out after {:?}, continuing without it",
                what, limit
            );
            Err(format!("timed out after {}s", limit.as_secs()))
        }
    }
}

pub mod mock {
    //! Scripted classifier for tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockAiClassifier {
        columns: Mutex<Option<ColumnClassificationResponse>>,
        categories: Mutex<Option<CategoryAliasResponse>>,
        delay: Mutex<Option<Duration>>,
        column_calls: AtomicUsize,
        category_calls: AtomicUsize,
        last_column_request: Mutex<Option<ColumnClassificationRequest>>,
        last_category_request: Mutex<Option<CategoryAliasRequest>>,
    }

    impl MockAiClassifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Column answers as `(column, field tag)` pairs.
        pub fn with_columns(self, pairs: &[(&str, &str)]) -> Self {
            *lock(&self.columns) = Some(ColumnClassificationResponse {
                assignments: pairs
                    .iter()
                    .map(|(c, f)| ColumnSuggestion {
                        column: c.to_string(),
                        field: f.to_string(),
                    })
                    .collect(),
            });
            self
        }

        /// Category answers as `(report, contract)` pairs.
        pub fn with_categories(self, pairs: &[(&str, Option<&str>)]) -> Self {
            *lock(&self.categories) = Some(CategoryAliasResponse {
                mappings: pairs
                    .iter()
                    .map(|(r, c)| CategorySuggestion {
                        report_category: r.to_string(),
                        contract_category: c.map(str::to_string),
                        confidence: Some(0.9),
                    })
                    .collect(),
            });
            self
        }

        /// Every call sleeps this long before answering.
        pub fn with_delay(self, delay: Duration) -> Self {
            *lock(&self.delay) = Some(delay);
            self
        }

        pub fn column_calls(&self) -> usize {
            self.column_calls.load(Ordering::SeqCst)
        }

        pub fn category_calls(&self) -> usize {
            self.category_calls.load(Ordering::SeqCst)
        }

        pub fn last_column_request(&self) -> Option<ColumnClassificationRequest> {
            lock(&self.last_column_request).clone()
        }

        pub fn last_category_request(&self) -> Option<CategoryAliasRequest> {
            lock(&self.last_category_request).clone()
        }

        async fn pause(&self) {
            let delay = *lock(&self.delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[async_trait]
    impl AiClassifier for MockAiClassifier {
        async fn classify_columns(
            &self,
            request: &ColumnClassificationRequest,
        ) -> Result<ColumnClassificationResponse> {
            self.column_calls.fetch_add(1, Ordering::SeqCst);
            *lock(&self.last_column_request) = Some(request.clone());
            self.pause().await;
            let scripted = lock(&self.columns).clone();
            scripted.ok_or_else(|| RoyaltyError::ClassifierFailed("no scripted answer".into()))
        }

        async fn resolve_category_aliases(
            &self,
            request: &CategoryAliasRequest,
        ) -> Result<CategoryAliasResponse> {
            self.category_calls.fetch_add(1, Ordering::SeqCst);
            *lock(&self.last_category_request) = Some(request.clone());
            self.pause().await;
            let scripted = lock(&self.categories).clone();
            scripted.ok_or_else(|| RoyaltyError::ClassifierFailed("no scripted answer".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_degrades() {
        let classifier = mock::MockAiClassifier::new()
            .with_columns(&[("Amt Owed", "licensee_reported_royalty")])
            .with_delay(Duration::from_millis(200));
        let request = ColumnClassificationRequest {
            columns: vec![],
            candidate_fields: SemanticField::ALL.to_vec(),
        };
        let outcome = call_with_timeout(
            Duration::from_millis(20),
            "column classification",
            classifier.classify_columns(&request),
        )
        .await;
        assert!(outcome.unwrap_err().contains("timed out"));
    }

    #[tokio::test]
    async fn test_disabled_classifier_fails_softly() {
        let request = CategoryAliasRequest {
            report_categories: vec!["Tops".into()],
            contract_categories: vec!["Apparel".into()],
            hint_text: None,
        };
        let outcome = call_with_timeout(
            Duration::from_secs(1),
            "category resolution",
            DisabledClassifier.resolve_category_aliases(&request),
        )
        .await;
        assert!(outcome.is_err());
    }

    #[test]
    fn test_response_schema_mentions_fields() {
        let schema = schemars::schema_for!(ColumnClassificationResponse);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("assignments"));
        assert!(json.contains("field"));
    }
}
