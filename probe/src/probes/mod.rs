//! Built-in probes.

mod html;
mod yadis;

pub use html::HtmlProbe;
pub use yadis::YadisProbe;

/// Replace the character references that commonly appear in attribute values
/// and titles.
pub(crate) fn decode_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Trim and collapse runs of whitespace.
pub(crate) fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
