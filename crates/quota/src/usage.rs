//! Monthly usage admission (component C6).
//!
//! Grounded on the teacher's `billing::usage` field (referenced from
//! `BillingService` in `crates/billing/src/lib.rs`) and the monthly-limit
//! check call shape in `routes/mcp_proxy.rs`. The effective limit is always
//! `custom_monthly_limit.unwrap_or(tier.default_monthly_limit())`; usage is
//! incremented only after the proxied request completes, never at admission
//! time, so a request that never reaches the upstream never counts against
//! quota.

use plexmcp_shared::SubscriptionTier;
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::QuotaResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted { remaining: i64 },
    /// Over the effective limit but the tier allows overage billing to an
    /// external system; the request is still admitted.
    AdmittedOverage { overage_units: i64 },
    Denied { effective_limit: i64 },
}

pub struct UsageMeter {
    pool: PgPool,
}

impl UsageMeter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn effective_limit(tier: SubscriptionTier, custom_monthly_limit: Option<i64>) -> i64 {
        custom_monthly_limit.unwrap_or_else(|| tier.default_monthly_limit())
    }

    /// Allows overage billing to continue rather than hard-deny; tiers below
    /// Pro must be denied outright once the effective limit is reached,
    /// matching the teacher's Free/Starter-blocks vs Pro/Team/Enterprise-
    /// allows-overage split in `routes/mcp_proxy.rs`.
    fn tier_allows_overage(tier: SubscriptionTier) -> bool {
        matches!(
            tier,
            SubscriptionTier::Pro | SubscriptionTier::Team | SubscriptionTier::Enterprise
        )
    }

    /// Check whether `org_id` may make one more request this billing period
    /// without incrementing the counter. Admission and increment are split
    /// intentionally: a request that fails downstream (rate limited,
    /// upstream unavailable) must not consume quota.
    pub async fn check_admission(
        &self,
        org_id: Uuid,
        tier: SubscriptionTier,
        custom_monthly_limit: Option<i64>,
    ) -> QuotaResult<AdmissionDecision> {
        let period_start = current_period_start();
        let used: i64 = sqlx::query_scalar(
            r#"
            select requests_used from usage_counters
            where org_id = $1 and period_start = $2
            "#,
        )
        .bind(org_id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        let limit = Self::effective_limit(tier, custom_monthly_limit);
        if used < limit {
            Ok(AdmissionDecision::Admitted {
                remaining: limit.saturating_sub(used),
            })
        } else if Self::tier_allows_overage(tier) {
            Ok(AdmissionDecision::AdmittedOverage {
                overage_units: used.saturating_sub(limit) + 1,
            })
        } else {
            Ok(AdmissionDecision::Denied {
                effective_limit: limit,
            })
        }
    }

    /// Increment the counter for the current period after a request
    /// completes. Uses an upsert so the first request of a new period
    /// creates the row; concurrent increments are serialized by the row
    /// lock Postgres takes on the `on conflict` path, giving linearizable
    /// accounting without an explicit application-level CAS loop.
    pub async fn record_completed_request(&self, org_id: Uuid) -> QuotaResult<()> {
        let period_start = current_period_start();
        sqlx::query(
            r#"
            insert into usage_counters (org_id, period_start, requests_used, updated_at)
            values ($1, $2, 1, now())
            on conflict (org_id) do update set
                requests_used = case
                    when usage_counters.period_start = excluded.period_start
                    then usage_counters.requests_used + 1
                    else 1
                end,
                period_start = excluded.period_start,
                updated_at = now()
            "#,
        )
        .bind(org_id)
        .bind(period_start)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn current_period_start() -> Date {
    let now = OffsetDateTime::now_utc();
    Date::from_calendar_date(now.year(), now.month(), 1).unwrap_or_else(|_| now.date())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_limit_overrides_tier_default() {
        assert_eq!(
            UsageMeter::effective_limit(SubscriptionTier::Free, Some(5_000)),
            5_000
        );
        assert_eq!(
            UsageMeter::effective_limit(SubscriptionTier::Free, None),
            SubscriptionTier::Free.default_monthly_limit()
        );
    }

    #[test]
    fn only_pro_and_above_allow_overage() {
        assert!(!UsageMeter::tier_allows_overage(SubscriptionTier::Free));
        assert!(!UsageMeter::tier_allows_overage(SubscriptionTier::Starter));
        assert!(UsageMeter::tier_allows_overage(SubscriptionTier::Pro));
        assert!(UsageMeter::tier_allows_overage(SubscriptionTier::Team));
        assert!(UsageMeter::tier_allows_overage(SubscriptionTier::Enterprise));
    }
}
