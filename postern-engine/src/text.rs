//! Plain-text rendering of HTML bodies.

use once_cell::sync::Lazy;
use regex::Regex;

static SCRIPT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static STYLE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());
static BREAK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</li>|</h[1-6]>|</tr>").unwrap());
static LI_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<li[^>]*>").unwrap());
static TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static NEWLINES_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

const ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    // Last, so "&amp;lt;" stays "&lt;".
    ("&amp;", "&"),
];

/// Render an HTML body as plain text for the `text/plain` alternative.
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_REGEX.replace_all(html, "");
    let text = STYLE_REGEX.replace_all(&text, "");
    let text = BREAK_REGEX.replace_all(&text, "\n");
    let text = LI_REGEX.replace_all(&text, "- ");
    let text = TAG_REGEX.replace_all(&text, "");

    let mut text = text.into_owned();
    for (entity, replacement) in ENTITIES {
        text = text.replace(entity, replacement);
    }

    NEWLINES_REGEX.replace_all(&text, "\n\n").trim().to_string()
}
