//! Scrubbing of credential material from diagnostic text.

use std::sync::LazyLock;

use regex::Regex;

use crate::Credential;

const REDACTED: &str = "[redacted]";

/// Secrets shorter than this are too likely to collide with ordinary text.
const MIN_SECRET_LEN: usize = 4;

static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=\-]+").unwrap());

static TOKEN_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(access_token|refresh_token|client_secret)("?\s*[:=]\s*"?)[^&"'\s,}]+"#)
        .unwrap()
});

/// Remove the credential's secrets, and anything shaped like a token, from `text`.
pub fn redact(text: &str, credential: &Credential) -> String {
    let mut out = text.to_string();
    for secret in credential.secrets() {
        if secret.len() >= MIN_SECRET_LEN {
            out = out.replace(secret, REDACTED);
        }
    }
    let out = BEARER_RE.replace_all(&out, "Bearer [redacted]").into_owned();
    TOKEN_FIELD_RE
        .replace_all(&out, format!("${{1}}${{2}}{}", REDACTED).as_str())
        .into_owned()
}

/// Cut `text` to at most `max` characters.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
