//! Shell-style tokenizing and `key=value` argument handling.
//!
//! Status bodies, command bodies, and discovery payloads are all
//! space-separated token streams with optional `key=value` pairs, where a
//! token may be quoted the way a POSIX shell quotes it: double quotes with
//! backslash escapes, or single quotes taken literally. [`split_args`]
//! implements that tokenizer; [`find_kwarg`] and [`find_kwarg_as_int`]
//! extract values from the resulting argv.

use crate::error::{Error, Result};

/// Split a line into shell-style tokens.
///
/// Handles double quotes (with `\"`, `\\`, `\n`, `\r`, `\t` and `\xHH`
/// escapes), single quotes (literal except `\'`), and runs of unquoted
/// characters; adjacent quoted and unquoted spans concatenate into one
/// token, as a shell would parse `foo"bar baz"`. An unterminated quote is
/// a protocol error.
pub fn split_args(line: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        // Skip inter-token whitespace.
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        let mut in_double = false;
        let mut in_single = false;

        loop {
            let Some(c) = chars.next() else {
                if in_double || in_single {
                    return Err(Error::Protocol(format!("unterminated quote in: {line}")));
                }
                break;
            };

            if in_double {
                match c {
                    '\\' => match chars.next() {
                        Some('n') => token.push('\n'),
                        Some('r') => token.push('\r'),
                        Some('t') => token.push('\t'),
                        Some('x') => {
                            let hi = chars.next();
                            let lo = chars.next();
                            match (hi, lo) {
                                (Some(h), Some(l)) if h.is_ascii_hexdigit() && l.is_ascii_hexdigit() => {
                                    let byte = (h.to_digit(16).unwrap() * 16
                                        + l.to_digit(16).unwrap())
                                        as u8;
                                    token.push(byte as char);
                                }
                                _ => {
                                    return Err(Error::Protocol(format!(
                                        "bad \\x escape in: {line}"
                                    )));
                                }
                            }
                        }
                        Some(other) => token.push(other),
                        None => {
                            return Err(Error::Protocol(format!("unterminated quote in: {line}")));
                        }
                    },
                    '"' => in_double = false,
                    other => token.push(other),
                }
            } else if in_single {
                match c {
                    '\\' if chars.peek() == Some(&'\'') => {
                        chars.next();
                        token.push('\'');
                    }
                    '\'' => in_single = false,
                    other => token.push(other),
                }
            } else {
                match c {
                    '"' => in_double = true,
                    '\'' => in_single = true,
                    c if c.is_whitespace() => break,
                    other => token.push(other),
                }
            }
        }

        argv.push(token);
    }

    Ok(argv)
}

/// Find the value of the first `key=value` token matching `key`.
///
/// Returns `None` when no token carries the key. A bare `key=` yields an
/// empty value.
pub fn find_kwarg<'a>(argv: &'a [String], key: &str) -> Option<&'a str> {
    argv.iter().find_map(|token| {
        let (k, v) = token.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Find a `key=value` token and parse the value as an unsigned integer.
///
/// Accepts decimal or `0x`-prefixed hexadecimal. Returns `None` when the
/// key is absent or the value does not parse.
pub fn find_kwarg_as_int(argv: &[String], key: &str) -> Option<u64> {
    let value = find_kwarg(argv, key)?;
    parse_uint(value)
}

/// Parse an unsigned integer in decimal or `0x`-prefixed hex.
pub fn parse_uint(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse::<u64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_simple() {
        let argv = split_args("slice 1 set mode=USB").unwrap();
        assert_eq!(argv, vec!["slice", "1", "set", "mode=USB"]);
    }

    #[test]
    fn split_collapses_whitespace() {
        let argv = split_args("  a \t b   c  ").unwrap();
        assert_eq!(argv, vec!["a", "b", "c"]);
    }

    #[test]
    fn split_empty() {
        assert!(split_args("").unwrap().is_empty());
        assert!(split_args("   ").unwrap().is_empty());
    }

    #[test]
    fn split_double_quotes() {
        let argv = split_args(r#"set label="two words" x=1"#).unwrap();
        assert_eq!(argv, vec!["set", "label=two words", "x=1"]);
    }

    #[test]
    fn split_double_quote_escapes() {
        let argv = split_args(r#""a\"b" "tab\there" "\x41\x42""#).unwrap();
        assert_eq!(argv, vec!["a\"b", "tab\there", "AB"]);
    }

    #[test]
    fn split_single_quotes_literal() {
        let argv = split_args(r#"'no $expansion' 'a\'b'"#).unwrap();
        assert_eq!(argv, vec!["no $expansion", "a'b"]);
    }

    #[test]
    fn split_adjacent_spans_concatenate() {
        let argv = split_args(r#"foo"bar baz"qux"#).unwrap();
        assert_eq!(argv, vec!["foobar bazqux"]);
    }

    #[test]
    fn split_unterminated_double_quote() {
        assert!(split_args(r#"bad "unterminated"#).is_err());
    }

    #[test]
    fn split_unterminated_single_quote() {
        assert!(split_args("bad 'unterminated").is_err());
    }

    #[test]
    fn kwarg_present() {
        let argv = split_args("slice 1 mode=USB tx=1").unwrap();
        assert_eq!(find_kwarg(&argv, "mode"), Some("USB"));
        assert_eq!(find_kwarg(&argv, "tx"), Some("1"));
    }

    #[test]
    fn kwarg_absent() {
        let argv = split_args("slice 1 mode=USB").unwrap();
        assert_eq!(find_kwarg(&argv, "rx"), None);
    }

    #[test]
    fn kwarg_first_match_wins() {
        let argv = split_args("x=1 x=2").unwrap();
        assert_eq!(find_kwarg(&argv, "x"), Some("1"));
    }

    #[test]
    fn kwarg_empty_value() {
        let argv = split_args("x= y=2").unwrap();
        assert_eq!(find_kwarg(&argv, "x"), Some(""));
    }

    #[test]
    fn kwarg_as_int_decimal() {
        let argv = split_args("port=4992").unwrap();
        assert_eq!(find_kwarg_as_int(&argv, "port"), Some(4992));
    }

    #[test]
    fn kwarg_as_int_hex() {
        let argv = split_args("stream=0x8800F00D").unwrap();
        assert_eq!(find_kwarg_as_int(&argv, "stream"), Some(0x8800_F00D));
    }

    #[test]
    fn kwarg_as_int_bad_value() {
        let argv = split_args("port=radio").unwrap();
        assert_eq!(find_kwarg_as_int(&argv, "port"), None);
    }

    #[test]
    fn parse_uint_forms() {
        assert_eq!(parse_uint("42"), Some(42));
        assert_eq!(parse_uint("0x2A"), Some(42));
        assert_eq!(parse_uint("0X2a"), Some(42));
        assert_eq!(parse_uint(""), None);
        assert_eq!(parse_uint("-1"), None);
    }
}
