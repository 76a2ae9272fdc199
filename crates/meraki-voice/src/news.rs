//! Optional headline-lookup collaborator.
//!
//! When the final transcript asks for news, the orchestrator fetches a short
//! list of headlines and injects them as extra generation context. Missing
//! credentials or a failed lookup degrade silently: the turn proceeds without
//! the context.

use crate::error::{AgentError, AgentResult};
use std::time::Duration;
use tracing::debug;

const NEWS_INTENT_KEYWORDS: &[&str] = &["news", "headline", "headlines", "current events"];

/// True when the user's utterance looks like a request for headlines.
pub fn wants_headlines(text: &str) -> bool {
    let lower = text.to_lowercase();
    NEWS_INTENT_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Format fetched headlines into a generation context block.
pub fn headlines_context(headlines: &[String]) -> String {
    let mut out = String::from("Current top headlines:\n");
    for h in headlines {
        out.push_str("- ");
        out.push_str(h);
        out.push('\n');
    }
    out
}

/// Headline client over the NewsAPI top-headlines endpoint.
#[derive(Debug, Clone)]
pub struct NewsLookup {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl NewsLookup {
    /// Build from environment: `NEWS_API_KEY`. Returning `Err` here only means
    /// the collaborator is unavailable; the caller treats that as "no tool".
    pub fn from_env() -> AgentResult<Self> {
        let api_key = std::env::var("NEWS_API_KEY")
            .map_err(|_| AgentError::Config("NEWS_API_KEY not set".to_string()))?;
        Self::new("https://newsapi.org", api_key)
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AgentError::Tool(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Fetch up to `limit` current headlines.
    pub async fn top_headlines(&self, limit: usize) -> AgentResult<Vec<String>> {
        let url = format!(
            "{}/v2/top-headlines?country=us&pageSize={}",
            self.base_url.trim_end_matches('/'),
            limit,
        );
        let response = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| AgentError::Tool(format!("news request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Tool(format!(
                "news API error: {}",
                response.status()
            )));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Tool(e.to_string()))?;
        let headlines: Vec<String> = json
            .get("articles")
            .and_then(|a| a.as_array())
            .map(|articles| {
                articles
                    .iter()
                    .filter_map(|a| a.get("title").and_then(|t| t.as_str()))
                    .map(String::from)
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default();
        debug!("news lookup returned {} headlines", headlines.len());
        Ok(headlines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_detection_is_case_insensitive() {
        assert!(wants_headlines("What's in the News today?"));
        assert!(wants_headlines("give me the latest headlines"));
        assert!(!wants_headlines("how is the weather"));
    }

    #[test]
    fn context_block_lists_headlines() {
        let block = headlines_context(&["First story".to_string(), "Second story".to_string()]);
        assert!(block.starts_with("Current top headlines:"));
        assert!(block.contains("- First story\n"));
        assert!(block.contains("- Second story\n"));
    }
}
