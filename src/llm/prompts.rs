//! Prompt construction for the fix path.

use crate::util::{tail_chars, truncate_middle};

/// Cap on how much source we put in a prompt. A small local model loses the
/// plot long before its context window technically fills up.
pub const MAX_PROMPT_SOURCE_CHARS: usize = 6_000;

/// Cap on captured error text fed back as failure context.
pub const MAX_PROMPT_ERROR_CHARS: usize = 2_000;

pub const FIX_SYSTEM: &str = "You are an expert Python debugger. Fix the reported issue in the code below.\n\
Return ONLY the complete corrected Python code in a single fenced code block.\n\
Do not explain the fix. Do not include anything outside the code block.";

/// Assemble a bounded-size prompt from the source, the finding under
/// attack, and captured execution error text from a prior run, if any.
pub fn build_fix_prompt(source: &str, finding: &str, error_text: Option<&str>) -> String {
    let mut prompt = format!(
        "{}\n\nISSUE:\n{}\n\nCODE:\n```python\n{}\n```\n",
        FIX_SYSTEM,
        finding,
        truncate_middle(source, MAX_PROMPT_SOURCE_CHARS),
    );

    if let Some(error) = error_text {
        prompt.push_str(&format!(
            "\nRUNTIME ERROR FROM LAST EXECUTION:\n{}\n",
            tail_chars(error, MAX_PROMPT_ERROR_CHARS),
        ));
    }

    prompt.push_str("\nFIXED CODE:\n");
    prompt
}
