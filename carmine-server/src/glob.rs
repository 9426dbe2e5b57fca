//! Redis-style glob matching: `*`, `?`, `[abc]`, `[^abc]`, `[a-z]`, and
//! backslash escapes. Shared by `KEYS` and the pub/sub pattern index.

/// Match `pattern` against `text`, byte-wise.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match_at(pattern, text)
}

fn match_at(mut pattern: &[u8], mut text: &[u8]) -> bool {
    while let Some(&p) = pattern.first() {
        match p {
            b'*' => {
                // Collapse runs of stars, then backtrack over every split.
                while pattern.get(1) == Some(&b'*') {
                    pattern = &pattern[1..];
                }
                if pattern.len() == 1 {
                    return true;
                }
                for i in 0..=text.len() {
                    if match_at(&pattern[1..], &text[i..]) {
                        return true;
                    }
                }
                return false;
            }
            b'?' => {
                if text.is_empty() {
                    return false;
                }
                pattern = &pattern[1..];
                text = &text[1..];
            }
            b'[' => {
                let Some(&c) = text.first() else {
                    return false;
                };
                let (matched, rest) = match_class(&pattern[1..], c);
                if !matched {
                    return false;
                }
                pattern = rest;
                text = &text[1..];
            }
            b'\\' if pattern.len() > 1 => {
                if text.first() != Some(&pattern[1]) {
                    return false;
                }
                pattern = &pattern[2..];
                text = &text[1..];
            }
            literal => {
                if text.first() != Some(&literal) {
                    return false;
                }
                pattern = &pattern[1..];
                text = &text[1..];
            }
        }
    }
    text.is_empty()
}

/// Match one `[...]` class against `c`; returns (matched, pattern after the
/// closing bracket). An unterminated class never matches.
fn match_class(class: &[u8], c: u8) -> (bool, &[u8]) {
    let (negated, mut rest) = match class.first() {
        Some(b'^') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut matched = false;
    loop {
        match rest {
            [] => return (false, rest),
            [b']', tail @ ..] => {
                return (matched != negated, tail);
            }
            [b'\\', escaped, tail @ ..] => {
                if *escaped == c {
                    matched = true;
                }
                rest = tail;
            }
            [lo, b'-', hi, tail @ ..] if *hi != b']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                if (lo..=hi).contains(&c) {
                    matched = true;
                }
                rest = tail;
            }
            [single, tail @ ..] => {
                if *single == c {
                    matched = true;
                }
                rest = tail;
            }
        }
    }
}

/// The literal characters before the first metacharacter; the pub/sub trie
/// indexes patterns under this prefix.
pub fn literal_prefix(pattern: &[u8]) -> &[u8] {
    let end = pattern
        .iter()
        .position(|&b| matches!(b, b'*' | b'?' | b'[' | b'\\'))
        .unwrap_or(pattern.len());
    &pattern[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_and_wildcards() {
        assert!(glob_match(b"hello", b"hello"));
        assert!(!glob_match(b"hello", b"hell"));
        assert!(glob_match(b"h*llo", b"heeeello"));
        assert!(glob_match(b"h*", b"h"));
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"h?llo", b"hallo"));
        assert!(!glob_match(b"h?llo", b"hllo"));
        assert!(glob_match(b"news.*", b"news.sports"));
        assert!(!glob_match(b"news.*", b"weather.sports"));
    }

    #[test]
    fn classes() {
        assert!(glob_match(b"h[ae]llo", b"hello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[ae]llo", b"hillo"));
        assert!(glob_match(b"h[^e]llo", b"hallo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"h[a-c]llo", b"hbllo"));
        assert!(!glob_match(b"h[a-c]llo", b"hdllo"));
        assert!(!glob_match(b"h[ae", b"ha"));
    }

    #[test]
    fn escapes() {
        assert!(glob_match(b"h\\*llo", b"h*llo"));
        assert!(!glob_match(b"h\\*llo", b"heello"));
        assert!(glob_match(b"h\\?", b"h?"));
    }

    #[test]
    fn star_backtracking() {
        assert!(glob_match(b"a*b*c", b"aXbXbXc"));
        assert!(!glob_match(b"a*b*c", b"aXbXbX"));
        assert!(glob_match(b"**", b"anything"));
    }

    #[test]
    fn prefixes() {
        assert_eq!(literal_prefix(b"news.*"), b"news.");
        assert_eq!(literal_prefix(b"*"), b"");
        assert_eq!(literal_prefix(b"exact"), b"exact");
        assert_eq!(literal_prefix(b"a?b"), b"a");
    }
}

#[cfg(test)]
mod props {
    use super::*;
    use test_strategy::proptest;

    fn alnum() -> impl proptest::strategy::Strategy<Value = Vec<u8>> {
        proptest::collection::vec(
            proptest::sample::select(b"abcxyz019".to_vec()),
            0..12,
        )
    }

    /// A metacharacter-free pattern matches exactly itself.
    #[proptest]
    fn literal_patterns_are_exact(
        #[strategy(alnum())] pattern: Vec<u8>,
        #[strategy(alnum())] other: Vec<u8>,
    ) {
        assert!(glob_match(&pattern, &pattern));
        assert_eq!(glob_match(&pattern, &other), pattern == other);
    }

    /// `<prefix>*` matches any text carrying that prefix, and the trie key
    /// extracted from it is the prefix.
    #[proptest]
    fn star_suffix_matches_prefixed_text(
        #[strategy(alnum())] prefix: Vec<u8>,
        #[strategy(alnum())] tail: Vec<u8>,
    ) {
        let mut pattern = prefix.clone();
        pattern.push(b'*');
        let mut text = prefix.clone();
        text.extend_from_slice(&tail);
        assert!(glob_match(&pattern, &text));
        assert_eq!(literal_prefix(&pattern), prefix.as_slice());
    }
}
