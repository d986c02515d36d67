//! Ready-made rule sets.
//!
//! [`tiered_rules`] is a conventional quota layout for a public API with
//! anonymous, authenticated, premium and admin callers, plus tighter limits on
//! expensive endpoints.
//!
//! ```rust
//! use tollgate::config::AccessTier;
//! use tollgate::presets;
//! use tollgate::rate_limit::RuleSet;
//!
//! let rules = RuleSet::new(presets::tiered_rules());
//! let rule = rules.select(AccessTier::Public, "/ml/predict/churn").unwrap();
//! assert_eq!(rule.id(), presets::ML_PREDICTIONS);
//! assert_eq!(rule.limit(), 50);
//! ```

use crate::config::{AccessTier, RateLimitRule, ScopeKind};
use std::time::Duration;

pub const PUBLIC_BASIC: &str = "public_basic";
pub const AUTHENTICATED_STANDARD: &str = "authenticated_standard";
pub const PREMIUM_EXTENDED: &str = "premium_extended";
pub const ADMIN_UNLIMITED: &str = "admin_unlimited";
pub const ML_PREDICTIONS: &str = "ml_predictions_limited";
pub const DATA_EXPORT: &str = "data_export_limited";

const HOUR: Duration = Duration::from_secs(3600);

const PUBLIC_LIMIT: u64 = 100;
const AUTHENTICATED_LIMIT: u64 = 1_000;
const PREMIUM_LIMIT: u64 = 10_000;
const ADMIN_LIMIT: u64 = 100_000;
const ML_PREDICTIONS_LIMIT: u64 = 50;
const DATA_EXPORT_LIMIT: u64 = 10;

/// Hourly quotas per tier, with stricter limits on `/ml/predict/*` for public
/// callers and on `/export/*` and `/backup/*` for authenticated callers.
pub fn tiered_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule::new(PUBLIC_BASIC, ScopeKind::PerIp, PUBLIC_LIMIT, HOUR),
        RateLimitRule::new(AUTHENTICATED_STANDARD, ScopeKind::PerUser, AUTHENTICATED_LIMIT, HOUR)
            .for_tier(AccessTier::Authenticated),
        RateLimitRule::new(PREMIUM_EXTENDED, ScopeKind::PerUser, PREMIUM_LIMIT, HOUR)
            .for_tier(AccessTier::Premium),
        RateLimitRule::new(ADMIN_UNLIMITED, ScopeKind::PerUser, ADMIN_LIMIT, HOUR)
            .for_tier(AccessTier::Admin),
        RateLimitRule::new(ML_PREDICTIONS, ScopeKind::PerIp, ML_PREDICTIONS_LIMIT, HOUR)
            .with_paths(["/ml/predict/*"]),
        RateLimitRule::new(DATA_EXPORT, ScopeKind::PerUser, DATA_EXPORT_LIMIT, HOUR)
            .for_tier(AccessTier::Authenticated)
            .with_paths(["/export/*", "/backup/*"]),
    ]
}
