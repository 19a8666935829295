//! Message rendering: fills `{{placeholder}}` slots from the lead and the
//! opaque content context persisted at enrollment. Content is never
//! re-fetched at send time.

use std::collections::HashMap;

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::OutboundMessage;

use crate::catalog::{self, MessageTemplate};

/// Lead fields the templates may reference.
#[derive(Debug, Clone, Default)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
    pub company: Option<String>,
}

/// Render `template_id` for a recipient. Unknown template ids are a validation error.
pub fn render(
    template_id: &str,
    recipient: &Recipient,
    context: &serde_json::Value,
    unsubscribe_url: &str,
) -> Result<OutboundMessage> {
    let template = catalog::template(template_id).ok_or_else(|| {
        LeadflowError::validation(format!("unknown template id '{template_id}'"))
    })?;
    Ok(render_template(template, recipient, context, unsubscribe_url))
}

fn render_template(
    template: &MessageTemplate,
    recipient: &Recipient,
    context: &serde_json::Value,
    unsubscribe_url: &str,
) -> OutboundMessage {
    let vars = variables(recipient, context, unsubscribe_url);

    let subject = fill(template.subject, &vars, false);
    let mut html = fill(template.body, &vars, true);
    html.push_str(&fill(catalog::footer(), &vars, true));

    OutboundMessage {
        to: recipient.email.clone(),
        subject: subject.trim().to_string(),
        html,
    }
}

fn variables(
    recipient: &Recipient,
    context: &serde_json::Value,
    unsubscribe_url: &str,
) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    if let Some(obj) = context.as_object() {
        for (key, value) in obj {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(", "),
                _ => continue,
            };
            vars.insert(key.clone(), text);
        }
    }

    let first_name = recipient
        .name
        .as_deref()
        .and_then(|n| n.split_whitespace().next())
        .unwrap_or("there")
        .to_string();
    vars.entry("first_name".into()).or_insert(first_name);
    vars.entry("name".into())
        .or_insert_with(|| recipient.name.clone().unwrap_or_default());
    vars.entry("company".into())
        .or_insert_with(|| recipient.company.clone().unwrap_or_else(|| "your team".into()));
    vars.insert("email".into(), recipient.email.clone());
    vars.insert("unsubscribe_url".into(), unsubscribe_url.to_string());
    vars
}

/// Replace every `{{key}}` with its value. Unknown keys render empty.
fn fill(text: &str, vars: &HashMap<String, String>, escape: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = vars.get(key) {
                    if escape {
                        out.push_str(&escape_html(value));
                    } else {
                        out.push_str(value);
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ana() -> Recipient {
        Recipient {
            email: "ana@acme.io".into(),
            name: Some("Ana Lima".into()),
            company: Some("Acme".into()),
        }
    }

    #[test]
    fn test_render_fills_lead_and_context() {
        let ctx = serde_json::json!({
            "blueprint_title": "Warehouse automation",
            "blueprint_summary": "Start with <b>pick</b> routing",
            "blueprint_url": "https://app.example.com/b/1",
        });
        let msg = render("hot_blueprint_ready", &ana(), &ctx, "https://x/unsub?t=1").unwrap();
        assert_eq!(msg.to, "ana@acme.io");
        assert_eq!(msg.subject, "Ana, your blueprint is ready");
        assert!(msg.html.contains("Your blueprint for Acme is ready: Warehouse automation."));
        assert!(msg.html.contains("Start with &lt;b&gt;pick&lt;/b&gt; routing"));
        assert!(msg.html.contains("https://x/unsub?t=1"));
    }

    #[test]
    fn test_render_fallbacks_and_unknown_placeholders() {
        let recipient = Recipient {
            email: "x@y.io".into(),
            ..Default::default()
        };
        let msg = render("hot_book_call", &recipient, &serde_json::Value::Null, "u").unwrap();
        assert!(msg.html.starts_with("<p>Hi there,</p>"));
        assert!(msg.html.contains("for your team."));
        // booking_url absent → empty href
        assert!(msg.html.contains("<a href=\"\">Pick a time</a>"));
    }

    #[test]
    fn test_unknown_template_is_validation_error() {
        let err = render("gone", &ana(), &serde_json::json!({}), "u").unwrap_err();
        assert!(matches!(err, LeadflowError::Validation(_)));
    }

    #[test]
    fn test_fill_handles_unterminated_braces() {
        let vars = HashMap::from([("a".to_string(), "1".to_string())]);
        assert_eq!(fill("x {{a}} y {{b", &vars, false), "x 1 y {{b");
        assert_eq!(fill("{{ a }}{{missing}}", &vars, false), "1");
    }

    #[test]
    fn test_context_arrays_are_joined() {
        let ctx = serde_json::json!({"resources": ["Guide", "Checklist"]});
        let msg = render("cold_resources", &ana(), &ctx, "u").unwrap();
        assert!(msg.html.contains("Guide, Checklist"));
    }
}
