//! Shell-like whitespace tokenizer.
//!
//! Splits a command line into tokens the way a simple shell would: runs of
//! whitespace separate tokens, `"` and `'` are equivalent quote characters
//! (whitespace inside them is preserved literally), and `\` escapes the
//! single byte that follows it, whether or not that byte is inside quotes.
//! The escaping backslash itself is never part of the output — it's
//! consumed, and the following byte is copied through unchanged, even if
//! that byte would otherwise have been special (a quote, another
//! backslash, or whitespace).
//!
//! A connection may install a different tokenizer entirely (the type
//! exists precisely so applications can swap this one out); this is only
//! the one the library ships as the default.

use thiserror::Error;

/// Returned when a command line would produce more tokens than the
/// caller's limit allows. Mirrors the `-1` return of the original
/// tokenizer: nothing is dispatched, the caller is expected to report a
/// "too many arguments" condition back to the client.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("too many tokens")]
pub struct TooManyTokens;

/// Tokenizes `line` into at most `argc_max` tokens.
///
/// Returns `Err(TooManyTokens)` if the line would need more than
/// `argc_max` tokens to represent; in that case no tokens are returned at
/// all, matching the original's all-or-nothing overflow contract.
pub fn tokenize(line: &str, argc_max: usize) -> Result<Vec<String>, TooManyTokens> {
    let mut argv: Vec<String> = Vec::with_capacity(argc_max);
    let mut current = String::new();
    let mut in_token = false;
    let mut escaped = false;
    let mut quote: Option<char> = None;

    for ch in line.chars() {
        if argv.len() >= argc_max {
            return Err(TooManyTokens);
        }

        if escaped {
            if !in_token {
                in_token = true;
            }
            current.push(ch);
            escaped = false;
        } else if let Some(q) = quote {
            if !in_token {
                in_token = true;
            }
            if ch == q {
                quote = None;
            } else if ch == '\\' {
                escaped = true;
            } else {
                current.push(ch);
            }
        } else if ch.is_whitespace() {
            if in_token {
                argv.push(std::mem::take(&mut current));
                in_token = false;
            }
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '"' || ch == '\'' {
            quote = Some(ch);
        } else {
            if !in_token {
                in_token = true;
            }
            current.push(ch);
        }
    }

    if in_token {
        if argv.len() >= argc_max {
            return Err(TooManyTokens);
        }
        argv.push(current);
    }

    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(tokenize("a b c", 8).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn collapses_runs_of_whitespace() {
        assert_eq!(tokenize("a   b\tc", 8).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn double_and_single_quotes_are_equivalent() {
        assert_eq!(tokenize(r#"a "b c" 'd e' f"#, 8).unwrap(), vec!["a", "b c", "d e", "f"]);
    }

    #[test]
    fn quoted_whitespace_is_preserved_literally() {
        assert_eq!(tokenize(r#""b c""#, 8).unwrap(), vec!["b c"]);
    }

    #[test]
    fn backslash_escapes_the_next_byte_and_is_itself_dropped() {
        // the backslash never appears in the output -- only the byte after it does,
        // whether that byte is ordinary, a quote character, or another backslash.
        assert_eq!(tokenize(r#"f\\ g"#, 8).unwrap(), vec!["f\\", "g"]);
        assert_eq!(tokenize(r#"a\"b"#, 8).unwrap(), vec!["a\"b"]);
    }

    #[test]
    fn escape_works_the_same_inside_quotes() {
        // '\n' inside single quotes: the backslash is consumed, 'n' is copied
        // literally -- not turned into a newline, and not kept alongside the backslash.
        assert_eq!(tokenize(r#"'d\ne'"#, 8).unwrap(), vec!["dne"]);
    }

    #[test]
    fn escaped_space_merges_into_the_following_token() {
        // the backslash starts a new token at the space boundary (escaping
        // re-arms `in_token`), but nothing re-arms a *boundary* right after
        // the escaped byte -- so the unescaped `b` that follows lands in the
        // same token as the escaped space, giving "a", " b", not three
        // separate tokens.
        assert_eq!(tokenize(r#"a \ b"#, 8).unwrap(), vec!["a", " b"]);
    }

    #[test]
    fn empty_line_yields_no_tokens() {
        assert_eq!(tokenize("", 8).unwrap(), Vec::<String>::new());
        assert_eq!(tokenize("   ", 8).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn trailing_backslash_is_silently_dropped() {
        assert_eq!(tokenize(r#"ab\"#, 8).unwrap(), vec!["ab"]);
    }

    #[test]
    fn overflow_reports_too_many_tokens() {
        assert_eq!(tokenize("a b c d", 3), Err(TooManyTokens));
    }

    #[test]
    fn exact_capacity_does_not_overflow() {
        assert_eq!(tokenize("a b c", 3).unwrap(), vec!["a", "b", "c"]);
    }
}
