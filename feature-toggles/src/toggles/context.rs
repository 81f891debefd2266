use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};

/// The request facts strategies and constraints are evaluated against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub remote_address: Option<String>,
    pub environment: Option<String>,
    pub app_name: Option<String>,
    pub current_time: Option<DateTime<Utc>>,
    pub properties: HashMap<String, String>,
}

impl EvaluationContext {
    /// Builds a context from flat query parameters. Known field names map onto their
    /// fields, `properties[<key>]` and any other key land in `properties`.
    pub fn from_query(params: HashMap<String, String>) -> Self {
        let mut context = EvaluationContext::default();
        for (key, value) in params {
            match key.as_str() {
                "userId" => context.user_id = Some(value),
                "sessionId" => context.session_id = Some(value),
                "remoteAddress" => context.remote_address = Some(value),
                "environment" => context.environment = Some(value),
                "appName" => context.app_name = Some(value),
                "currentTime" => {
                    // An unparseable time falls back to "now" at evaluation.
                    context.current_time = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|time| time.with_timezone(&Utc));
                }
                _ => {
                    let property = key
                        .strip_prefix("properties[")
                        .and_then(|rest| rest.strip_suffix(']'))
                        .map(String::from)
                        .unwrap_or(key);
                    context.properties.insert(property, value);
                }
            }
        }
        context
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = Some(environment.to_string());
        self
    }

    pub fn with_remote_address_fallback(mut self, address: Option<String>) -> Self {
        if self.remote_address.is_none() {
            self.remote_address = address;
        }
        self
    }

    /// Looks up a context field by the name constraints use for it.
    pub fn field(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "userId" => self.user_id.as_deref().map(Cow::Borrowed),
            "sessionId" => self.session_id.as_deref().map(Cow::Borrowed),
            "remoteAddress" => self.remote_address.as_deref().map(Cow::Borrowed),
            "environment" => self.environment.as_deref().map(Cow::Borrowed),
            "appName" => self.app_name.as_deref().map(Cow::Borrowed),
            "currentTime" => Some(Cow::Owned(
                self.now().to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            other => self.properties.get(other).map(|v| Cow::Borrowed(v.as_str())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.current_time.unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_known_fields_are_mapped() {
        let context = EvaluationContext::from_query(params(&[
            ("userId", "123"),
            ("sessionId", "abc"),
            ("appName", "web"),
            ("environment", "production"),
        ]));
        assert_eq!(context.user_id.as_deref(), Some("123"));
        assert_eq!(context.session_id.as_deref(), Some("abc"));
        assert_eq!(context.field("appName").as_deref(), Some("web"));
        assert_eq!(context.field("environment").as_deref(), Some("production"));
        assert!(context.properties.is_empty());
    }

    #[test]
    fn test_properties_are_collected() {
        let context = EvaluationContext::from_query(params(&[
            ("properties[tier]", "gold"),
            ("region", "eu"),
        ]));
        assert_eq!(context.field("tier").as_deref(), Some("gold"));
        assert_eq!(context.field("region").as_deref(), Some("eu"));
        assert_eq!(context.field("missing"), None);
    }

    #[test]
    fn test_current_time_is_parsed() {
        let context =
            EvaluationContext::from_query(params(&[("currentTime", "2024-03-01T10:00:00Z")]));
        assert_eq!(
            context.field("currentTime").as_deref(),
            Some("2024-03-01T10:00:00.000Z")
        );
    }

    #[test]
    fn test_remote_address_fallback_does_not_override() {
        let context = EvaluationContext::from_query(params(&[("remoteAddress", "10.0.0.1")]))
            .with_remote_address_fallback(Some("127.0.0.1".to_string()));
        assert_eq!(context.remote_address.as_deref(), Some("10.0.0.1"));

        let context = EvaluationContext::default()
            .with_remote_address_fallback(Some("127.0.0.1".to_string()));
        assert_eq!(context.remote_address.as_deref(), Some("127.0.0.1"));
    }
}
