//! Helpers shared by the outbound HTTP clients.

pub(crate) const REDACTED_BODY_MAX_LEN: usize = 200;

/// Trimmed response body, cut to [`REDACTED_BODY_MAX_LEN`] characters, for
/// error messages and logs.
pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    let mut shortened = trimmed.chars().take(REDACTED_BODY_MAX_LEN).collect::<String>();
    if trimmed.chars().count() > REDACTED_BODY_MAX_LEN {
        shortened.push_str("...");
    }
    shortened
}
