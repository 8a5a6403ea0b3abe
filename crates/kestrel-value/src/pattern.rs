use std::fmt;

use regex::Regex;

/// A compiled pattern value.
///
/// The source text is retained so patterns can be compared and re-rendered;
/// matching goes through the compiled automaton.
#[derive(Debug)]
pub struct PatternVal {
    text: String,
    re: Regex,
}

impl PatternVal {
    pub fn new(text: &str) -> Result<PatternVal, regex::Error> {
        let re = Regex::new(text)?;
        Ok(PatternVal {
            text: text.to_string(),
            re,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Unanchored search, the `p in s` operator.
    pub fn is_match(&self, s: &str) -> bool {
        self.re.is_match(s)
    }

    /// Anchored whole-string match, the `s == p` operator.
    pub fn matches_exactly(&self, s: &str) -> bool {
        match self.re.find(s) {
            Some(m) => m.start() == 0 && m.end() == s.len(),
            None => false,
        }
    }
}

impl fmt::Display for PatternVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_vs_exact() {
        let p = PatternVal::new("ab+").unwrap();
        assert!(p.is_match("xxabbyy"));
        assert!(!p.matches_exactly("xxabbyy"));
        assert!(p.matches_exactly("abb"));
    }
}
