//! Subscription tiers and their default monthly quota.
//!
//! Grounded on `routes/admin_legacy.rs::get_tier_limit` in the teacher: tier
//! names and the "enterprise is effectively unlimited" convention are kept,
//! generalized into a typed enum instead of a string match repeated at every
//! call site.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Starter,
    Pro,
    Team,
    Enterprise,
}

impl SubscriptionTier {
    /// Default monthly request quota for a tier that has not set a custom
    /// limit. `Enterprise` is unlimited, represented as `i64::MAX` so callers
    /// can compare with ordinary integer arithmetic without a special case.
    pub fn default_monthly_limit(self) -> i64 {
        match self {
            SubscriptionTier::Free => 1_000,
            SubscriptionTier::Starter => 10_000,
            SubscriptionTier::Pro => 50_000,
            SubscriptionTier::Team => 500_000,
            SubscriptionTier::Enterprise => i64::MAX,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Starter => "starter",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Team => "team",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }

    pub fn from_str_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "starter" => SubscriptionTier::Starter,
            "pro" => SubscriptionTier::Pro,
            "team" => SubscriptionTier::Team,
            "enterprise" => SubscriptionTier::Enterprise,
            _ => SubscriptionTier::Free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enterprise_is_effectively_unlimited() {
        assert_eq!(SubscriptionTier::Enterprise.default_monthly_limit(), i64::MAX);
    }

    #[test]
    fn unknown_tier_string_falls_back_to_free() {
        assert_eq!(SubscriptionTier::from_str_lenient("bogus"), SubscriptionTier::Free);
    }

    #[test]
    fn round_trips_through_as_str() {
        for tier in [
            SubscriptionTier::Free,
            SubscriptionTier::Starter,
            SubscriptionTier::Pro,
            SubscriptionTier::Team,
            SubscriptionTier::Enterprise,
        ] {
            assert_eq!(SubscriptionTier::from_str_lenient(tier.as_str()), tier);
        }
    }
}
