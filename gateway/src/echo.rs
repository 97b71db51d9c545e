//! Detection of backends that answer with the prompt itself.

/// Responses shorter than this are checked for prefix overlap.
const SHORT_RESPONSE_CHARS: usize = 200;
/// Minimum overlap length that counts as an echo.
const MIN_OVERLAP_CHARS: usize = 50;

/// Whether `response` is the prompt (or a large prefix of it) sent back.
pub fn is_echo(prompt: &str, response: &str) -> bool {
    let prompt = prompt.trim();
    let response = response.trim();
    if response == prompt {
        return true;
    }
    if response.chars().count() >= SHORT_RESPONSE_CHARS {
        return false;
    }
    (prompt.starts_with(response) && response.chars().count() >= MIN_OVERLAP_CHARS)
        || (response.starts_with(prompt) && prompt.chars().count() >= MIN_OVERLAP_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbatim_echo() {
        assert!(is_echo("X", "X"));
        assert!(is_echo("hello there", "  hello there\n"));
    }

    #[test]
    fn test_prefix_overlap() {
        let prompt = "a".repeat(120);
        assert!(is_echo(&prompt, &"a".repeat(60)));
        assert!(!is_echo(&prompt, &"a".repeat(20)));
    }

    #[test]
    fn test_response_extending_prompt() {
        let prompt = "Summarise the following release notes for the team channel please";
        let response = format!("{} ok", prompt);
        assert!(is_echo(prompt, &response));
        assert!(!is_echo("hi", "hi there, how can I help?"));
    }

    #[test]
    fn test_long_responses_are_not_prefix_checked() {
        let prompt = "b".repeat(400);
        assert!(!is_echo(&prompt, &"b".repeat(250)));
    }

    #[test]
    fn test_real_answer() {
        assert!(!is_echo("What is 2+2?", "4"));
    }
}
