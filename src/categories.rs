//! Resolves report-side category labels onto a contract's category names.
//!
//! Every entry carries its provenance. Which provenances are trusted without
//! review is decided by the caller, not here.

use crate::ai::{call_with_timeout, AiClassifier, AiStatus, CategoryAliasRequest};
use crate::schema::{CategoryMapping, CategoryProvenance};
use crate::utils::normalize_label;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The contract category whose name matches `value` once both are normalized.
pub fn exact_match<'c>(value: &str, contract_categories: &'c [String]) -> Option<&'c String> {
    let wanted = normalize_label(value);
    contract_categories
        .iter()
        .find(|c| normalize_label(c) == wanted)
}

/// A saved licensee alias, only if it still points at a configured category.
pub fn saved_alias(
    value: &str,
    aliases: &BTreeMap<String, String>,
    contract_categories: &[String],
) -> Option<String> {
    let wanted = normalize_label(value);
    let target = aliases
        .iter()
        .find(|(report, _)| normalize_label(report) == wanted)
        .map(|(_, contract)| contract)?;
    exact_match(target, contract_categories).cloned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryResolution {
    /// False when every report value matched a contract category by name
    pub required: bool,
    pub mapping: CategoryMapping,
    pub ai_status: AiStatus,
}

impl CategoryResolution {
    /// Resolution for a sheet that needs no category work at all.
    pub fn not_required() -> Self {
        Self {
            required: false,
            mapping: CategoryMapping::new(),
            ai_status: AiStatus::NotNeeded,
        }
    }
}

pub struct CategoryReconciler<'a> {
    ai: &'a dyn AiClassifier,
    timeout: Duration,
}

impl<'a> CategoryReconciler<'a> {
    pub fn new(ai: &'a dyn AiClassifier, timeout: Duration) -> Self {
        Self { ai, timeout }
    }

    pub async fn reconcile(
        &self,
        report_values: &[String],
        contract_categories: &[String],
        saved_aliases: &BTreeMap<String, String>,
        hint_text: Option<String>,
    ) -> CategoryResolution {
        let mut mapping = CategoryMapping::new();
        let mut pending = Vec::new();

        for value in report_values {
            if let Some(name) = exact_match(value, contract_categories) {
                mapping.insert(value.clone(), Some(name.clone()), CategoryProvenance::Exact);
            } else if let Some(name) = saved_alias(value, saved_aliases, contract_categories) {
                debug!("Category '{}' -> '{}' (saved alias)", value, name);
                mapping.insert(value.clone(), Some(name), CategoryProvenance::Saved);
            } else {
                pending.push(value.clone());
            }
        }

        let required = mapping
            .iter()
            .any(|(_, a)| a.provenance != CategoryProvenance::Exact)
            || !pending.is_empty();

        let ai_status = if pending.is_empty() {
            AiStatus::NotNeeded
        } else {
            self.resolve_with_ai(&pending, contract_categories, hint_text, &mut mapping)
                .await
        };

        info!(
            "Reconciled {} category values against {} contract categories ({} unmapped)",
            report_values.len(),
            contract_categories.len(),
            mapping.unmapped().len()
        );

        CategoryResolution {
            required,
            mapping,
            ai_status,
        }
    }

    async fn resolve_with_ai(
        &self,
        pending: &[String],
        contract_categories: &[String],
        hint_text: Option<String>,
        mapping: &mut CategoryMapping,
    ) -> AiStatus {
        // Unmapped until the AI says otherwise, so a degraded call still lists them.
        for value in pending {
            mapping.insert(value.clone(), None, CategoryProvenance::Unmapped);
        }

        let request = CategoryAliasRequest {
            report_categories: pending.to_vec(),
            contract_categories: contract_categories.to_vec(),
            hint_text: hint_text.filter(|h| !h.trim().is_empty()),
        };

        let response = match call_with_timeout(
            self.timeout,
            "category resolution",
            self.ai.resolve_category_aliases(&request),
        )
        .await
        {
            Ok(response) => response,
            Err(reason) => return AiStatus::Degraded { reason },
        };

        for suggestion in response.mappings {
            let Some(value) = pending
                .iter()
                .find(|p| p.trim().eq_ignore_ascii_case(suggestion.report_category.trim()))
            else {
                debug!(
                    "Ignoring AI answer for unknown category '{}'",
                    suggestion.report_category
                );
                continue;
            };
            let target = suggestion
                .contract_category
                .as_deref()
                .and_then(|c| exact_match(c, contract_categories));
            match target {
                Some(name) => {
                    debug!(
                        "Category '{}' -> '{}' (AI, confidence {:?})",
                        value, name, suggestion.confidence
                    );
                    mapping.insert(value.clone(), Some(name.clone()), CategoryProvenance::Ai);
                }
                None => {
                    if let Some(invented) = &suggestion.contract_category {
                        warn!(
                            "AI mapped '{}' to '{}', which is not a contract category",
                            value, invented
                        );
                    }
                }
            }
        }

        AiStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::mock::MockAiClassifier;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn contract_categories() -> Vec<String> {
        names(&["Apparel", "Accessories", "Footwear"])
    }

    #[tokio::test]
    async fn test_exact_matches_need_no_review() {
        let ai = MockAiClassifier::new();
        let reconciler = CategoryReconciler::new(&ai, Duration::from_secs(1));
        let result = reconciler
            .reconcile(
                &names(&["apparel", "FOOTWEAR"]),
                &contract_categories(),
                &BTreeMap::new(),
                None,
            )
            .await;
        assert!(!result.required);
        assert_eq!(result.mapping.resolve("apparel"), Some("Apparel"));
        assert_eq!(result.mapping.resolve("FOOTWEAR"), Some("Footwear"));
        assert_eq!(ai.category_calls(), 0);
        assert_eq!(result.ai_status, AiStatus::NotNeeded);
    }

    #[tokio::test]
    async fn test_aliases_resolved_by_one_ai_call() {
        let ai = MockAiClassifier::new().with_categories(&[
            ("Tops & Bottoms", Some("Apparel")),
            ("Hard Accessories", Some("accessories")),
        ]);
        let reconciler = CategoryReconciler::new(&ai, Duration::from_secs(1));
        let result = reconciler
            .reconcile(
                &names(&["Tops & Bottoms", "Hard Accessories", "Footwear"]),
                &contract_categories(),
                &BTreeMap::new(),
                Some("Categories follow the 2024 catalogue".to_string()),
            )
            .await;

        assert!(result.required);
        assert_eq!(ai.category_calls(), 1);
        let request = ai.last_category_request().unwrap();
        assert_eq!(request.report_categories, names(&["Tops & Bottoms", "Hard Accessories"]));
        assert!(request.hint_text.is_some());

        let tops = result.mapping.get("Tops & Bottoms").unwrap();
        assert_eq!(tops.contract_category.as_deref(), Some("Apparel"));
        assert_eq!(tops.provenance, CategoryProvenance::Ai);
        // Normalized onto the configured spelling.
        assert_eq!(result.mapping.resolve("Hard Accessories"), Some("Accessories"));
        assert_eq!(
            result.mapping.get("Footwear").unwrap().provenance,
            CategoryProvenance::Exact
        );
    }

    #[tokio::test]
    async fn test_invented_or_missing_ai_answers_stay_unmapped() {
        let ai = MockAiClassifier::new().with_categories(&[
            ("Gadgets", Some("Electronics")),
            ("Misc", None),
        ]);
        let reconciler = CategoryReconciler::new(&ai, Duration::from_secs(1));
        let result = reconciler
            .reconcile(
                &names(&["Gadgets", "Misc", "Hard Accessories"]),
                &contract_categories(),
                &BTreeMap::new(),
                None,
            )
            .await;
        let mut unmapped = result.mapping.unmapped();
        unmapped.sort();
        assert_eq!(unmapped, vec!["Gadgets", "Hard Accessories", "Misc"]);
        assert_eq!(
            result.mapping.get("Gadgets").unwrap().provenance,
            CategoryProvenance::Unmapped
        );
    }

    #[tokio::test]
    async fn test_saved_alias_used_before_ai() {
        let ai = MockAiClassifier::new();
        let reconciler = CategoryReconciler::new(&ai, Duration::from_secs(1));
        let mut aliases = BTreeMap::new();
        aliases.insert("Tops & Bottoms".to_string(), "Apparel".to_string());
        aliases.insert("Gizmos".to_string(), "Retired Category".to_string());

        let result = reconciler
            .reconcile(
                &names(&["tops & bottoms", "Gizmos"]),
                &contract_categories(),
                &aliases,
                None,
            )
            .await;

        let tops = result.mapping.get("tops & bottoms").unwrap();
        assert_eq!(tops.provenance, CategoryProvenance::Saved);
        assert_eq!(tops.contract_category.as_deref(), Some("Apparel"));
        // Alias to a category the contract no longer has goes to AI, which is not scripted here.
        assert_eq!(ai.category_calls(), 1);
        assert!(matches!(result.ai_status, AiStatus::Degraded { .. }));
        assert_eq!(result.mapping.resolve("Gizmos"), None);
    }

    #[test]
    fn test_label_matching_agrees_with_mapping_lookup() {
        let categories = names(&["Écharpes", "Tops & Bottoms"]);
        assert_eq!(
            exact_match("ÉCHARPES", &categories).map(String::as_str),
            Some("Écharpes")
        );
        assert_eq!(
            exact_match(" tops  &  bottoms", &categories).map(String::as_str),
            Some("Tops & Bottoms")
        );

        let mut mapping = CategoryMapping::new();
        mapping.insert("Écharpes", Some("Écharpes".to_string()), CategoryProvenance::Exact);
        assert_eq!(mapping.resolve("ÉCHARPES"), Some("Écharpes"));

        let mut aliases = BTreeMap::new();
        aliases.insert("FOULARDS".to_string(), "écharpes".to_string());
        assert_eq!(
            saved_alias("Foulards", &aliases, &categories).as_deref(),
            Some("Écharpes")
        );
    }
}
