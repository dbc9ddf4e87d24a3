//! `%%ident%%` substitution
//!
//! When publish arguments are built, any string value that is exactly a
//! `%%name%%` token is replaced by the router field of that name. Structures
//! serialize to JSON; unknown tokens stay literal so a bad template is
//! visible downstream instead of silently emptied.

use serde_json::{Map, Value};
use tracing::warn;

use sito_common::PublishArgs;

/// Extract the identifier from an exact `%%ident%%` token.
fn token_ident(raw: &str) -> Option<&str> {
    let inner = raw.strip_prefix("%%")?.strip_suffix("%%")?;
    if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(inner)
    } else {
        None
    }
}

/// Render a field value as the substituted string. Scalars print bare,
/// structures as JSON.
fn render(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        structured => serde_json::to_string(structured).ok(),
    }
}

/// Substitute one string; returns the original when it is not a token or the
/// field is unknown.
pub fn expand_str(fields: &Map<String, Value>, raw: &str) -> String {
    let Some(ident) = token_ident(raw) else {
        return raw.to_string();
    };
    match fields.get(ident).and_then(render) {
        Some(expanded) => expanded,
        None => {
            warn!(token = %raw, "No router field for macro token, leaving literal");
            raw.to_string()
        }
    }
}

/// Expand every string value of a publish-args set in place.
pub fn expand_publish_args(fields: &Map<String, Value>, args: &mut PublishArgs) {
    args.exchange = expand_str(fields, &args.exchange);
    args.routing_key = expand_str(fields, &args.routing_key);
    for value in args.extras.values_mut() {
        if let Value::String(s) = value {
            *value = Value::String(expand_str(fields, s));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("msgData".into(), json!({"a": 1}));
        map.insert("carrier".into(), json!("telco-1"));
        map.insert("shard".into(), json!(7));
        map
    }

    #[test]
    fn scalar_field_substitutes_bare() {
        assert_eq!(expand_str(&fields(), "%%carrier%%"), "telco-1");
        assert_eq!(expand_str(&fields(), "%%shard%%"), "7");
    }

    #[test]
    fn structure_serializes_to_json() {
        assert_eq!(expand_str(&fields(), "%%msgData%%"), r#"{"a":1}"#);
    }

    #[test]
    fn unknown_token_stays_literal() {
        assert_eq!(expand_str(&fields(), "%%missing%%"), "%%missing%%");
    }

    #[test]
    fn partial_tokens_are_not_substituted() {
        assert_eq!(expand_str(&fields(), "pre-%%carrier%%"), "pre-%%carrier%%");
        assert_eq!(expand_str(&fields(), "%%bad ident%%"), "%%bad ident%%");
        assert_eq!(expand_str(&fields(), "%%%%"), "%%%%");
        assert_eq!(expand_str(&fields(), "plain"), "plain");
    }

    #[test]
    fn publish_args_expand_in_place() {
        let mut args = PublishArgs::new("%%carrier%%", "route-%%x%%");
        args.extras
            .insert("payload_hint".into(), json!("%%msgData%%"));
        args.extras.insert("fixed".into(), json!(12));
        expand_publish_args(&fields(), &mut args);

        assert_eq!(args.exchange, "telco-1");
        assert_eq!(args.routing_key, "route-%%x%%");
        assert_eq!(args.extras["payload_hint"], json!(r#"{"a":1}"#));
        assert_eq!(args.extras["fixed"], json!(12));
    }
}
