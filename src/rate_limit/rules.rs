//! Validated rule set and best-match selection.

use crate::config::{AccessTier, RateLimitRule};
use std::cmp::Ordering;
use tracing::warn;

/// Rules in declaration order, already validated.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RateLimitRule>,
    skipped: usize,
}

impl RuleSet {
    /// Invalid rules and duplicate ids are skipped with a warning. An empty set
    /// admits everything.
    pub fn new<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = RateLimitRule>,
    {
        let mut kept: Vec<RateLimitRule> = Vec::new();
        let mut skipped = 0;
        for rule in rules {
            if let Err(err) = rule.validate() {
                warn!(target: "tollgate::rate_limit", error = %err, "skipping invalid rate limit rule");
                skipped += 1;
                continue;
            }
            if kept.iter().any(|r| r.id() == rule.id()) {
                warn!(target: "tollgate::rate_limit", rule = rule.id(), "skipping duplicate rate limit rule id");
                skipped += 1;
                continue;
            }
            kept.push(rule);
        }
        Self { rules: kept, skipped }
    }

    /// Most specific enabled rule for `tier` whose patterns match `path`.
    pub fn select(&self, tier: AccessTier, path: &str) -> Option<&RateLimitRule> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.is_enabled() && rule.tier() == tier)
            .filter_map(|(index, rule)| specificity(rule, path).map(|s| (s, index, rule)))
            .min_by(|a, b| by_specificity(a.0, a.1, b.0, b.1))
            .map(|(_, _, rule)| rule)
    }

    pub fn get(&self, id: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|r| r.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter()
    }

    pub fn active_count(&self) -> usize {
        self.rules.iter().filter(|r| r.is_enabled()).count()
    }

    /// Loaded rules, enabled or not. Skipped rules are not counted.
    pub fn total_count(&self) -> usize {
        self.rules.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Text a path must start with: the pattern with every `*` removed.
fn literal(pattern: &str) -> String {
    pattern.replace('*', "")
}

/// Literal prefix before the first wildcard; ranks matching patterns.
fn prefix_len(pattern: &str) -> usize {
    pattern.split('*').next().map_or(0, str::len)
}

/// Longest literal prefix among the matching patterns, or `None` if none match.
fn specificity(rule: &RateLimitRule, path: &str) -> Option<usize> {
    rule.paths()
        .iter()
        .filter(|pattern| path.starts_with(literal(pattern).as_str()))
        .map(|pattern| prefix_len(pattern))
        .max()
}

/// Longer literal prefix first, then earlier declaration.
fn by_specificity(a_len: usize, a_index: usize, b_len: usize, b_index: usize) -> Ordering {
    b_len.cmp(&a_len).then(a_index.cmp(&b_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeKind;
    use std::time::Duration;

    fn rule(id: &str, paths: &[&str]) -> RateLimitRule {
        RateLimitRule::new(id, ScopeKind::PerIp, 10, Duration::from_secs(60))
            .with_paths(paths.iter().copied())
    }

    #[test]
    fn longest_literal_prefix_wins() {
        let rules = RuleSet::new(vec![
            rule("catch_all", &["*"]),
            rule("ml", &["/ml/*"]),
            rule("predict", &["/ml/predict/*"]),
        ]);
        assert_eq!(rules.select(AccessTier::Public, "/ml/predict/foo").unwrap().id(), "predict");
        assert_eq!(rules.select(AccessTier::Public, "/ml/train").unwrap().id(), "ml");
        assert_eq!(rules.select(AccessTier::Public, "/other").unwrap().id(), "catch_all");
    }

    #[test]
    fn mid_pattern_wildcard_ranks_by_text_before_it() {
        // "/a/*/b" matches paths starting with "/a//b" but ranks as "/a/".
        let rules = RuleSet::new(vec![rule("mid", &["/a/*/b"]), rule("deeper", &["/a//*"])]);
        assert_eq!(rules.select(AccessTier::Public, "/a//b/c").unwrap().id(), "deeper");
        assert_eq!(prefix_len("/a/*/b"), 3);
        assert_eq!(prefix_len("*"), 0);
        assert_eq!(prefix_len("/exact"), 6);
    }

    #[test]
    fn ties_go_to_first_declared() {
        let rules = RuleSet::new(vec![rule("first", &["/a/*"]), rule("second", &["/a/*"])]);
        assert_eq!(rules.select(AccessTier::Public, "/a/b").unwrap().id(), "first");
    }

    #[test]
    fn tier_must_match_exactly() {
        let rules = RuleSet::new(vec![
            rule("public", &["*"]),
            rule("auth", &["*"]).for_tier(AccessTier::Authenticated),
        ]);
        assert_eq!(rules.select(AccessTier::Authenticated, "/x").unwrap().id(), "auth");
        assert!(rules.select(AccessTier::Admin, "/x").is_none());
    }

    #[test]
    fn disabled_rules_are_ignored_but_counted() {
        let rules = RuleSet::new(vec![rule("off", &["*"]).disabled()]);
        assert!(rules.select(AccessTier::Public, "/x").is_none());
        assert_eq!(rules.active_count(), 0);
        assert_eq!(rules.total_count(), 1);
    }

    #[test]
    fn invalid_and_duplicate_rules_are_skipped() {
        let zero = RateLimitRule::new("zero", ScopeKind::Global, 0, Duration::from_secs(1));
        let rules = RuleSet::new(vec![zero, rule("a", &["*"]), rule("a", &["/x"])]);
        assert_eq!(rules.total_count(), 1);
        assert_eq!(rules.skipped_count(), 2);
        assert!(rules.get("zero").is_none());
    }

    #[test]
    fn most_specific_pattern_of_a_rule_counts() {
        let rules = RuleSet::new(vec![
            rule("export", &["/export/*", "/backup/*"]),
            rule("generic", &["/backup"]),
        ]);
        assert_eq!(rules.select(AccessTier::Public, "/backup/db").unwrap().id(), "export");
    }

    #[test]
    fn empty_set_matches_nothing() {
        assert!(RuleSet::default().select(AccessTier::Public, "/").is_none());
    }
}
