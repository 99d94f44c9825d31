// ---------------------------------------------------------------------------
// Whitespace tokenizer with [] and "" bracketed groups
// ---------------------------------------------------------------------------

/// Split a payload into tokens on spaces, treating `[...]` and `"..."` as
/// single grouped tokens (delimiters escapable with `\`).
///
/// A balanced pair of brackets or quotes yields exactly one token, even when
/// the group is empty, so `n` delimiters produce `n/2` grouped tokens plus
/// the surrounding whitespace-separated ones.
pub fn tokenize(buf: &[u8]) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut token: Vec<u8> = Vec::new();
    let mut last_delim: u8 = 0;

    for &v in buf {
        match v {
            b' ' | b'[' | b']' | b'"' => {
                if !token.is_empty() {
                    if token[token.len() - 1] == b'\\' {
                        token.push(v);
                        continue;
                    }
                    // Inside an open group, only the matching closer ends
                    // the token.
                    if last_delim == b'"' && v != b'"' {
                        token.push(v);
                        continue;
                    }
                    if last_delim == b'[' && v != b']' {
                        token.push(v);
                        continue;
                    }
                    tokens.push(String::from_utf8_lossy(&token).into_owned());
                    token.clear();
                } else {
                    // Empty group: `[]` or `""` still yields one token.
                    if (last_delim == b'"' && v == b'"') || (last_delim == b'[' && v == b']') {
                        tokens.push(String::new());
                    }
                }
                last_delim = v;
            }
            _ => token.push(v),
        }
    }
    if !token.is_empty() {
        tokens.push(String::from_utf8_lossy(&token).into_owned());
    }
    tokens
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_whitespace_split() {
        assert_eq!(tokenize(b"a bb ccc"), vec!["a", "bb", "ccc"]);
    }

    #[test]
    fn bracket_group_is_one_token() {
        assert_eq!(
            tokenize(b"x [10/Oct/2000:13:55:36 -0700] y"),
            vec!["x", "10/Oct/2000:13:55:36 -0700", "y"]
        );
    }

    #[test]
    fn quote_group_is_one_token() {
        assert_eq!(
            tokenize(br#"1.2.3.4 "GET / HTTP/1.1" 200"#),
            vec!["1.2.3.4", "GET / HTTP/1.1", "200"]
        );
    }

    #[test]
    fn escaped_delimiter_stays_in_token() {
        assert_eq!(tokenize(br#""a\"b" c"#), vec![r#"a\"b"#, "c"]);
    }

    #[test]
    fn empty_group_yields_empty_token() {
        assert_eq!(tokenize(br#"a "" b"#), vec!["a", "", "b"]);
        assert_eq!(tokenize(b"a [] b"), vec!["a", "", "b"]);
    }

    #[test]
    fn balanced_delimiters_group_count() {
        // 4 quotes -> 2 grouped tokens, plus 1 plain token.
        let tokens = tokenize(br#""one two" "three" plain"#);
        assert_eq!(tokens, vec!["one two", "three", "plain"]);
    }

    #[test]
    fn empty_input() {
        assert!(tokenize(b"").is_empty());
    }
}
