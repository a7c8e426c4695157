//! Extraction of a code candidate from raw model output.
//!
//! Models wrap code in markdown fences and pad it with commentary. We take
//! the first fenced block and discard everything else; a response with no
//! well-formed block means "no candidate", not an error.

/// Extract the first fenced code block from a model response.
///
/// A ```python fence is preferred; any fence is accepted. The returned text
/// is trimmed and newline-terminated so it can be written straight to a
/// sandbox scratch file.
pub fn extract_code_block(response: &str) -> Option<String> {
    const PATTERNS: [&str; 2] = [
        r"(?s)```(?:python|py)[ \t]*\n(.*?)```",
        r"(?s)```[A-Za-z0-9_+-]*[ \t]*\n?(.*?)```",
    ];

    for pattern in PATTERNS {
        let re = regex::Regex::new(pattern).ok()?;
        if let Some(caps) = re.captures(response) {
            let body = caps.get(1)?.as_str().trim();
            if !body.is_empty() {
                return Some(format!("{}\n", body));
            }
        }
    }

    None
}
