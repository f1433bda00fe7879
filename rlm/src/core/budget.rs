//! Character budget helpers for context and observation text.

/// Keep only the trailing `cap` characters of `context`.
///
/// `None` means no cap. The cut always lands on a char boundary.
pub fn trim_context(context: &str, cap: Option<usize>) -> &str {
    let Some(cap) = cap else {
        return context;
    };
    let total = context.chars().count();
    if total <= cap {
        return context;
    }
    let skip = total - cap;
    match context.char_indices().nth(skip) {
        Some((idx, _)) => &context[idx..],
        None => "",
    }
}

/// Keep only the leading `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cap_returns_input() {
        assert_eq!(trim_context("abcdef", None), "abcdef");
    }

    #[test]
    fn cap_keeps_trailing_chars() {
        assert_eq!(trim_context("abcdef", Some(2)), "ef");
        assert_eq!(trim_context("abc", Some(10)), "abc");
        assert_eq!(trim_context("abc", Some(0)), "");
    }

    #[test]
    fn cap_respects_multibyte_boundaries() {
        assert_eq!(trim_context("héllo wörld", Some(5)), "wörld");
    }

    #[test]
    fn truncate_keeps_leading_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
