use std::borrow::Cow;

/// Return the input string with an added "s" at the end if `count` is larger than one and non-zero.
pub fn pluralize(value: &str, count: usize) -> Cow<'_, str> {
    if count == 1 {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("{value}s"))
    }
}

/// Truncates the end of a string so that its total length doesn't exceed `length`.
pub fn truncate_end(value: &str, length: usize) -> Cow<'_, str> {
    assert!(length >= 3);
    if value.len() <= length {
        value.into()
    } else {
        format!("{}...", &value[..length - 3]).into()
    }
}

/// Quotes a string for safe inclusion in a generated shell script line.
pub fn quote_shell(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_shell() {
        assert_eq!(quote_shell("plain-path/x.sh"), "plain-path/x.sh");
        assert_eq!(quote_shell("two words"), "'two words'");
        assert_eq!(quote_shell("it's"), "'it'\\''s'");
        assert_eq!(quote_shell(""), "''");
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("task", 1), "task");
        assert_eq!(pluralize("task", 0), "tasks");
        assert_eq!(pluralize("task", 3), "tasks");
    }

    #[test]
    fn test_truncate_end() {
        assert_eq!(truncate_end("abc", 5), "abc");
        assert_eq!(truncate_end("abcdef", 5), "ab...");
    }
}
