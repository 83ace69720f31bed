//! String-ID pattern compilation
//!
//! Patterns are turned into anchored regular expressions once, at subscribe
//! time. All live pattern subscriptions share a single [`RegexSet`], so a
//! write tests every pattern in one pass.

use errors::{GatewayError, GatewayResult};
use regex::RegexSet;

/// How a pattern string is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Contains `*` or `?`
    Glob,
    /// Ends with `-` and has no wildcards, e.g. `DV-PLC001-`
    Prefix,
    /// Anything else: the whole string ID must match
    Exact,
}

/// A validated pattern and its anchored regex source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    pattern: String,
    kind: PatternKind,
    regex: String,
}

impl CompiledPattern {
    pub fn compile(pattern: &str) -> GatewayResult<Self> {
        if pattern.is_empty() {
            return Err(GatewayError::invalid_parameter(
                "pattern",
                "pattern must not be empty",
            ));
        }

        let kind = if pattern.contains(['*', '?']) {
            PatternKind::Glob
        } else if pattern.ends_with('-') {
            PatternKind::Prefix
        } else {
            PatternKind::Exact
        };

        let regex = match kind {
            PatternKind::Glob => {
                let mut out = String::with_capacity(pattern.len() + 8);
                out.push('^');
                let mut literal = String::new();
                for ch in pattern.chars() {
                    match ch {
                        '*' | '?' => {
                            out.push_str(&regex::escape(&literal));
                            literal.clear();
                            out.push_str(if ch == '*' { ".*" } else { "." });
                        },
                        _ => literal.push(ch),
                    }
                }
                out.push_str(&regex::escape(&literal));
                out.push('$');
                out
            },
            PatternKind::Prefix => format!("^{}", regex::escape(pattern)),
            PatternKind::Exact => format!("^{}$", regex::escape(pattern)),
        };

        Ok(Self {
            pattern: pattern.to_string(),
            kind,
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn regex_source(&self) -> &str {
        &self.regex
    }
}

/// All active patterns combined, each tagged with its owning subscription
pub struct PatternSet {
    set: RegexSet,
    owners: Vec<u64>,
}

impl Default for PatternSet {
    fn default() -> Self {
        Self {
            set: RegexSet::empty(),
            owners: Vec::new(),
        }
    }
}

impl PatternSet {
    pub fn build<'a>(entries: impl IntoIterator<Item = (u64, &'a CompiledPattern)>) -> GatewayResult<Self> {
        let mut owners = Vec::new();
        let mut sources = Vec::new();
        for (owner, pattern) in entries {
            owners.push(owner);
            sources.push(pattern.regex_source());
        }
        let set = RegexSet::new(sources)
            .map_err(|e| GatewayError::Internal(format!("pattern set build failed: {}", e)))?;
        Ok(Self { set, owners })
    }

    /// Owners of every pattern matching `string_id`
    pub fn matches<'a>(&'a self, string_id: &str) -> impl Iterator<Item = u64> + 'a {
        let hits = if self.owners.is_empty() {
            Vec::new()
        } else {
            self.set.matches(string_id).into_iter().collect()
        };
        hits.into_iter().map(move |i| self.owners[i])
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn is_match(pattern: &str, s: &str) -> bool {
        let compiled = CompiledPattern::compile(pattern).unwrap();
        let set = PatternSet::build([(1, &compiled)]).unwrap();
        let hit = set.matches(s).next().is_some();
        hit
    }

    #[test]
    fn test_pattern_kinds() {
        assert_eq!(CompiledPattern::compile("DV-*").unwrap().kind(), PatternKind::Glob);
        assert_eq!(CompiledPattern::compile("DV-PLC?-T").unwrap().kind(), PatternKind::Glob);
        assert_eq!(CompiledPattern::compile("DV-PLC001-").unwrap().kind(), PatternKind::Prefix);
        assert_eq!(CompiledPattern::compile("DV-PLC001-T").unwrap().kind(), PatternKind::Exact);
        assert!(CompiledPattern::compile("").is_err());
    }

    #[test]
    fn test_glob_matching() {
        assert!(is_match("DV-PLC001-*", "DV-PLC001-TEMP"));
        assert!(!is_match("DV-PLC001-*", "DV-PLC002-TEMP"));
        assert!(is_match("DV-PLC*-TEMP*", "DV-PLC007-TEMP01"));
        assert!(!is_match("DV-PLC*-TEMP", "DV-PLC007-TEMP01"));
        assert!(is_match("DV-PLC00?-T", "DV-PLC009-T"));
        assert!(!is_match("DV-PLC00?-T", "DV-PLC0010-T"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(is_match("DV-A.B-*", "DV-A.B-X"));
        assert!(!is_match("DV-A.B-*", "DV-AxB-X"));
        assert!(is_match("SV-(x)-", "SV-(x)-1"));
    }

    #[test]
    fn test_prefix_and_exact() {
        assert!(is_match("DV-PLC001-", "DV-PLC001-ANY-THING"));
        assert!(!is_match("DV-PLC001-", "DV-PLC0011-X"));
        assert!(is_match("DV-PLC001-T", "DV-PLC001-T"));
        assert!(!is_match("DV-PLC001-T", "DV-PLC001-T2"));
    }

    #[test]
    fn test_set_reports_owners() {
        let a = CompiledPattern::compile("DV-*").unwrap();
        let b = CompiledPattern::compile("DV-PLC001-").unwrap();
        let c = CompiledPattern::compile("SV-*").unwrap();
        let set = PatternSet::build([(10, &a), (20, &b), (30, &c)]).unwrap();
        let mut owners: Vec<u64> = set.matches("DV-PLC001-T").collect();
        owners.sort_unstable();
        assert_eq!(owners, vec![10, 20]);
        assert_eq!(set.len(), 3);
        assert!(PatternSet::default().matches("DV-X-Y").next().is_none());
    }
}
