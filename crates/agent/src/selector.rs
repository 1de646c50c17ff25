//! Automatic strategy selection.
//!
//! One tools-disabled model call classifies the objective and recommends a
//! registered strategy. Anything unusable falls back to `react`.

use reasonloop_config::SelectorConfig;
use reasonloop_core::message::{Message, ModelReply};
use reasonloop_core::provider::CompletionRequest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::prompts::{SELECTOR_SYSTEM, extract_json};
use crate::runtime::Ports;
use crate::session::Session;

pub const FALLBACK_STRATEGY: &str = "react";
const FALLBACK_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub pattern_name: String,
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
    /// Task characteristics the classifier detected
    #[serde(default)]
    pub characteristics: BTreeMap<String, bool>,
}

impl Recommendation {
    fn fallback(reason: impl std::fmt::Display) -> Self {
        let characteristics = [("open_ended", true), ("exploratory", true)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            pattern_name: FALLBACK_STRATEGY.into(),
            confidence: FALLBACK_CONFIDENCE,
            reasoning: format!("Classification failed ({reason}), using {FALLBACK_STRATEGY}"),
            characteristics,
        }
    }

    /// Human-readable summary of the recommendation.
    pub fn explain(&self) -> String {
        let detected: Vec<&str> = self
            .characteristics
            .iter()
            .filter(|(_, on)| **on)
            .map(|(k, _)| k.as_str())
            .collect();
        format!(
            "Recommended: {} (confidence {:.0}%)\nWhy: {}\nDetected characteristics: {}",
            self.pattern_name,
            self.confidence * 100.0,
            self.reasoning,
            if detected.is_empty() { "none".to_string() } else { detected.join(", ") }
        )
    }
}

#[derive(Debug, Clone)]
pub struct PatternSelector {
    config: SelectorConfig,
}

impl PatternSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Whether `recommendation` is confident enough to act on.
    pub fn accepts(&self, recommendation: &Recommendation) -> bool {
        recommendation.confidence >= self.config.min_confidence
    }

    /// Recommend one of `available` for the session's objective.
    pub async fn select(&self, ports: &Ports, session: &mut Session, available: &[String]) -> Recommendation {
        let messages = vec![
            Message::system(SELECTOR_SYSTEM),
            Message::user(format!(
                "Available patterns: {}\n\nTask: {}\n\nRecommend the best reasoning pattern for this task.",
                available.join(", "),
                session.objective()
            )),
        ];
        let reply = match ports
            .ask_model(session, "selector", CompletionRequest::text_only(messages))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session_id = %session.id(), "Pattern selection failed: {e}");
                return Recommendation::fallback(e);
            }
        };

        let ModelReply::Text { content } = reply else {
            return Recommendation::fallback("classifier attempted a tool call");
        };
        let Some(mut recommendation) =
            extract_json(&content).and_then(|v| serde_json::from_value::<Recommendation>(v).ok())
        else {
            return Recommendation::fallback("unparsable reply");
        };
        if !available.iter().any(|name| *name == recommendation.pattern_name) {
            return Recommendation::fallback(format!("unknown pattern '{}'", recommendation.pattern_name));
        }
        recommendation.confidence = recommendation.confidence.clamp(0.0, 1.0);
        debug!(
            session_id = %session.id(),
            pattern = %recommendation.pattern_name,
            confidence = recommendation.confidence,
            "Pattern selected"
        );
        recommendation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use reasonloop_config::ContextConfig;
    use reasonloop_core::error::ProviderError;
    use serde_json::json;
    use std::sync::Arc;

    fn available() -> Vec<String> {
        ["lats", "plan-execute", "react", "rewoo"].map(String::from).to_vec()
    }

    fn selector() -> PatternSelector {
        PatternSelector::new(SelectorConfig {
            auto_select: true,
            min_confidence: 0.6,
        })
    }

    async fn select_with(provider: ScriptedProvider) -> (Recommendation, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let ports = ports(provider.clone(), basic_tools());
        let mut session = Session::new("Compare the populations of three cities", "react", ContextConfig::default());
        (selector().select(&ports, &mut session, &available()).await, provider)
    }

    #[tokio::test]
    async fn parses_recommendation() {
        let (rec, provider) = select_with(ScriptedProvider::new(vec![text(
            r#"Here you go: {"pattern_name": "rewoo", "confidence": 0.85,
                "reasoning": "independent lookups",
                "characteristics": {"parallel_tasks": true, "open_ended": false}}"#,
        )]))
        .await;
        assert_eq!(rec.pattern_name, "rewoo");
        assert!(selector().accepts(&rec));
        assert!(rec.explain().contains("parallel_tasks"));
        assert!(!provider.requests()[0].tools_enabled);
        assert!(provider.requests()[0].messages[1].content.contains("plan-execute"));
    }

    #[tokio::test]
    async fn unknown_pattern_falls_back() {
        let (rec, _) = select_with(ScriptedProvider::new(vec![text(
            r#"{"pattern_name": "routing", "confidence": 0.9}"#,
        )]))
        .await;
        assert_eq!(rec.pattern_name, FALLBACK_STRATEGY);
        assert_eq!(rec.confidence, 0.5);
        assert!(!selector().accepts(&rec));
    }

    #[tokio::test]
    async fn garbage_and_errors_fall_back() {
        let (rec, _) = select_with(ScriptedProvider::new(vec![text("react, probably")])).await;
        assert_eq!(rec.pattern_name, FALLBACK_STRATEGY);

        let (rec, _) = select_with(ScriptedProvider::new(vec![call("echo", json!({}))])).await;
        assert_eq!(rec.pattern_name, FALLBACK_STRATEGY);

        let (rec, _) = select_with(ScriptedProvider::with_results(vec![Err(ProviderError::RateLimited { retry_after_secs: 5 })])).await;
        assert_eq!(rec.pattern_name, FALLBACK_STRATEGY);
        assert!(rec.reasoning.contains("Classification failed"));
    }
}
