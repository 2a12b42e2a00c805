//! Rule patterns.
//!
//! A pattern is a target string in which `*` stands for one or more
//! characters other than `/`. Each wildcard binds one capture, numbered
//! from the left. Matching is greedy: when a string can be split between
//! wildcards in more than one way, earlier wildcards take as much as they
//! can (`*-*` against `a-b-c` binds `a-b` and `c`).

use std::fmt;

use regex::Regex;

use crate::error::{BuildError, Result};
use crate::target::normalize;

/// One piece of a pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Wildcard,
}

/// A parsed rule pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    segments: Vec<Vec<Token>>,
    wildcards: usize,
    regex: Regex,
}

impl Pattern {
    /// Parse and normalize a pattern.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason| BuildError::InvalidPattern {
            pattern: raw.into(),
            reason,
        };

        let source = normalize(raw).map_err(|_| invalid("pattern is empty"))?;
        if source.contains("**") {
            return Err(invalid("adjacent wildcards cannot be told apart"));
        }

        let segments: Vec<Vec<Token>> = source.split('/').map(tokenize).collect();
        let wildcards = source.matches('*').count();
        let body: Vec<String> = segments.iter().map(|s| segment_regex(s)).collect();
        let regex = Regex::new(&format!("^{}$", body.join("/")))
            .map_err(|_| invalid("cannot be compiled"))?;

        Ok(Self {
            source,
            segments,
            wildcards,
            regex,
        })
    }

    /// The normalized pattern text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Number of wildcards, which is also the number of captures a match binds.
    pub fn wildcards(&self) -> usize {
        self.wildcards
    }

    /// Returns `true` if the pattern contains no wildcard.
    pub fn is_literal(&self) -> bool {
        self.wildcards == 0
    }

    /// Number of literal characters; higher means more specific.
    pub fn specificity(&self) -> usize {
        self.source.chars().filter(|&c| c != '*').count()
    }

    /// Match a normalized target string, returning its captures in order.
    pub fn matches(&self, target: &str) -> Option<Vec<String>> {
        if self.is_literal() {
            return (self.source == target).then(Vec::new);
        }
        let caps = self.regex.captures(target)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                .collect(),
        )
    }

    /// Returns `true` if some target string matches both patterns.
    ///
    /// Wildcards never cross `/`, so the patterns must have the same number
    /// of segments and every pair of segments must admit a common string.
    pub fn overlaps(&self, other: &Pattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| segments_overlap(a, b))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn tokenize(segment: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (i, piece) in segment.split('*').enumerate() {
        if i > 0 {
            tokens.push(Token::Wildcard);
        }
        if !piece.is_empty() {
            tokens.push(Token::Literal(piece.to_string()));
        }
    }
    tokens
}

fn segment_regex(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| match t {
            Token::Literal(text) => regex::escape(text),
            Token::Wildcard => "([^/]+)".to_string(),
        })
        .collect()
}

fn literal_text(tokens: &[Token]) -> Option<String> {
    let mut text = String::new();
    for token in tokens {
        match token {
            Token::Literal(s) => text.push_str(s),
            Token::Wildcard => return None,
        }
    }
    Some(text)
}

fn segment_matches(tokens: &[Token], text: &str) -> bool {
    Regex::new(&format!("^{}$", segment_regex(tokens))).is_ok_and(|re| re.is_match(text))
}

/// Literal text before the first and after the last wildcard.
fn affixes(tokens: &[Token]) -> (&str, &str) {
    let prefix = match tokens.first() {
        Some(Token::Literal(s)) => s.as_str(),
        _ => "",
    };
    let suffix = match tokens.last() {
        Some(Token::Literal(s)) => s.as_str(),
        _ => "",
    };
    (prefix, suffix)
}

/// Two wildcarded segments share a match exactly when their prefixes and
/// suffixes are compatible: the middle literals of both can always be laid
/// out one after the other between them.
fn segments_overlap(a: &[Token], b: &[Token]) -> bool {
    match (literal_text(a), literal_text(b)) {
        (Some(x), Some(y)) => x == y,
        (Some(x), None) => segment_matches(b, &x),
        (None, Some(y)) => segment_matches(a, &y),
        (None, None) => {
            let (pa, sa) = affixes(a);
            let (pb, sb) = affixes(b);
            (pa.starts_with(pb) || pb.starts_with(pa)) && (sa.ends_with(sb) || sb.ends_with(sa))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Pattern {
        Pattern::parse(s).unwrap()
    }

    #[test]
    fn captures_bind_left_to_right() {
        let pat = p("build/pass1/*-*-*.ttf");
        assert_eq!(pat.wildcards(), 3);
        assert_eq!(
            pat.matches("build/pass1/Sans-CN-Bd.ttf").unwrap(),
            ["Sans", "CN", "Bd"]
        );
    }

    #[test]
    fn earlier_wildcards_are_greedy() {
        assert_eq!(p("out/*-*.bin").matches("out/a-b-c.bin").unwrap(), ["a-b", "c"]);
    }

    #[test]
    fn wildcard_stays_within_one_segment() {
        let pat = p("out/*.bin");
        assert!(pat.matches("out/sub/a.bin").is_none());
        assert!(pat.matches("out/.bin").is_none());
        assert_eq!(pat.matches("out/a.bin").unwrap(), ["a"]);
    }

    #[test]
    fn literal_patterns_match_exactly() {
        let pat = p("./out/NowarSansTTC-0.4.0.7z");
        assert!(pat.is_literal());
        assert_eq!(pat.as_str(), "out/NowarSansTTC-0.4.0.7z");
        assert_eq!(pat.matches("out/NowarSansTTC-0.4.0.7z").unwrap().len(), 0);
        assert!(pat.matches("out/NowarSansTTC-0x4.0.7z").is_none());
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pat = p("out/ttc/*-parts.*.otd");
        assert_eq!(pat.matches("out/ttc/R-parts.0.otd").unwrap(), ["R", "0"]);
        assert!(pat.matches("out/ttc/R-partsX0.otd").is_none());
    }

    #[test]
    fn invalid_patterns() {
        assert!(matches!(Pattern::parse(""), Err(BuildError::InvalidPattern { .. })));
        assert!(matches!(Pattern::parse("out/**.bin"), Err(BuildError::InvalidPattern { .. })));
    }

    #[test]
    fn specificity_counts_literal_characters() {
        assert!(p("out/special-*.bin").specificity() > p("out/*.bin").specificity());
        assert_eq!(p("*").specificity(), 0);
    }

    #[test]
    fn overlap_detection() {
        assert!(p("out/*.bin").overlaps(&p("out/*.bin")));
        assert!(p("out/a-*").overlaps(&p("out/*-b")));
        assert!(p("out/*.bin").overlaps(&p("out/special-*.bin")));
        assert!(p("out/*.bin").overlaps(&p("out/a.bin")));

        assert!(!p("out/*.bin").overlaps(&p("out/*.raw")));
        assert!(!p("out/*.bin").overlaps(&p("src/*.bin")));
        assert!(!p("hint/out/*.ttf").overlaps(&p("hint/source/fonts/*.ttf")));
        assert!(!p("out/ttc/*-*-*-parts.*.otd").overlaps(&p("out/ttc/*-*-*.ttc")));
        assert!(!p("out/a-*").overlaps(&p("out/b-*")));
    }
}
