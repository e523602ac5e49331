//! Per-recipient token substitution.

use serde_json::Value;

use crate::model::Contact;

/// Replace contact tokens in `template`.
///
/// Supported: `{{email}}`, `{{firstName}}`/`{{first_name}}`,
/// `{{lastName}}`/`{{last_name}}`, and `{{key}}` for each string attribute.
/// Unknown tokens are left as they are; nothing else is interpreted.
pub fn personalize(template: &str, contact: &Contact) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }

    let first = contact.first_name.as_deref().unwrap_or_default();
    let last = contact.last_name.as_deref().unwrap_or_default();

    let mut out = template
        .replace("{{email}}", &contact.email)
        .replace("{{firstName}}", first)
        .replace("{{first_name}}", first)
        .replace("{{lastName}}", last)
        .replace("{{last_name}}", last);

    for (key, value) in &contact.attributes {
        if let Value::String(text) = value {
            out = out.replace(&format!("{{{{{}}}}}", key), text);
        }
    }
    out
}
