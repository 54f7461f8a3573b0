//! Collaborators the engine calls out to: learned-rule persistence,
//! external services reached from `<sraix>`, and out-of-band commands.

use reqwest::blocking::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::ServicesConfig;
use crate::types::{RuleKey, RuleSource};

/// Durable storage for rules learned with `<learnf>`.
///
/// `key` is the rule's key in the store that learned it, so stored rules
/// are told apart exactly as the store tells them apart.
pub trait LearnedRuleSink: Send + Sync {
    /// Append `rule`, or replace the stored rule with the same key.
    fn persist(&self, key: &RuleKey, rule: &RuleSource) -> anyhow::Result<()>;

    /// Remove the stored rule with this key, if any.
    fn remove(&self, key: &RuleKey) -> anyhow::Result<()>;
}

/// A named external service answering free-text queries.
pub trait ExternalService: Send + Sync {
    fn call(&self, service: &str, query: &str, timeout: Duration) -> anyhow::Result<String>;
}

/// Handles out-of-band input, which bypasses matching entirely.
pub trait CommandDispatcher: Send + Sync {
    /// `command` is the input with the command prefix stripped.
    fn dispatch(&self, session_id: &str, command: &str) -> anyhow::Result<String>;
}

/// [`ExternalService`] over HTTP GET.
///
/// Each service maps to a URL template from `[services.endpoints]`; the
/// first `{query}` in the template is replaced by the URL-encoded query.
/// A JSON body with a string `response` or `text` field yields that field,
/// any other body is returned as text.
pub struct HttpService {
    client: Client,
    endpoints: HashMap<String, String>,
}

impl HttpService {
    pub fn new(config: &ServicesConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
        })
    }

    pub fn url_for(&self, service: &str, query: &str) -> anyhow::Result<String> {
        let template = self
            .endpoints
            .get(service)
            .ok_or_else(|| anyhow::anyhow!("no endpoint configured for service '{service}'"))?;
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        Ok(template.replacen("{query}", &encoded, 1))
    }
}

impl ExternalService for HttpService {
    fn call(&self, service: &str, query: &str, timeout: Duration) -> anyhow::Result<String> {
        let url = self.url_for(service, query)?;
        debug!(service, %url, "calling external service");

        let response = self.client.get(&url).timeout(timeout).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("{service} returned {status}: {body}");
        }

        let body = response.text()?;
        Ok(extract_answer(&body))
    }
}

fn extract_answer(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => ["response", "text"]
            .iter()
            .find_map(|field| json.get(field).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| body.trim().to_string()),
        Err(_) => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> HttpService {
        let mut config = ServicesConfig::default();
        config
            .endpoints
            .insert("weather".into(), "https://example.invalid/w?q={query}&u=c".into());
        HttpService::new(&config).expect("client")
    }

    #[test]
    fn url_template_encodes_query() {
        let url = service().url_for("weather", "new york & co").expect("url");
        assert_eq!(url, "https://example.invalid/w?q=new+york+%26+co&u=c");
    }

    #[test]
    fn unknown_service_is_an_error() {
        let err = service().url_for("stocks", "x").expect_err("should fail");
        assert!(err.to_string().contains("stocks"));
    }

    #[test]
    fn json_answer_field_is_extracted() {
        assert_eq!(extract_answer(r#"{"response":"Sunny"}"#), "Sunny");
        assert_eq!(extract_answer(r#"{"other":1}"#), r#"{"other":1}"#);
        assert_eq!(extract_answer(" plain \n"), "plain");
    }
}
