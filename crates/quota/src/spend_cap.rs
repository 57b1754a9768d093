//! Spend cap overage tracking.
//!
//! Grounded on the teacher's `billing::spend_cap` field and the spend-cap
//! pause check in `routes/mcp_proxy.rs`. A spend cap only ever *pauses*
//! further overage-billed requests once `current_period_spend_cents`
//! reaches `cap_amount_cents`; it never retroactively charges or refunds —
//! that reconciliation is an external billing system's job, out of scope
//! here.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::QuotaResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendCapCheck {
    /// No cap configured, or spend is below the cap.
    Ok,
    Paused { cap_amount_cents: i64 },
}

#[derive(Clone)]
pub struct SpendCap {
    pool: PgPool,
}

impl SpendCap {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn check(&self, org_id: Uuid) -> QuotaResult<SpendCapCheck> {
        let row: Option<(i64, bool)> = sqlx::query_as(
            r#"
            select cap_amount_cents, is_paused from spend_caps where org_id = $1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((cap_amount_cents, true)) => Ok(SpendCapCheck::Paused { cap_amount_cents }),
            _ => Ok(SpendCapCheck::Ok),
        }
    }

    /// Record overage spend and flip to paused once the cap is reached.
    /// `amount_cents` is an estimate supplied by the caller (e.g. a
    /// per-request flat overage rate); exact billing reconciliation happens
    /// externally.
    pub async fn record_overage_spend(&self, org_id: Uuid, amount_cents: i64) -> QuotaResult<()> {
        sqlx::query(
            r#"
            update spend_caps
            set current_period_spend_cents = current_period_spend_cents + $2,
                is_paused = (current_period_spend_cents + $2) >= cap_amount_cents,
                updated_at = now()
            where org_id = $1
            "#,
        )
        .bind(org_id)
        .bind(amount_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Zero out and unpause every spend cap whose tracked spend is still
    /// stamped with a prior calendar month. Unlike `usage_counters`, which
    /// rolls its period over inline on the next increment, a spend cap has
    /// no natural write to piggyback a rollover on while paused — so this
    /// is a standalone sweep, run by the worker, rather than logic inlined
    /// into `record_overage_spend`.
    pub async fn reset_elapsed_periods(&self) -> QuotaResult<u64> {
        let result = sqlx::query(
            r#"
            update spend_caps
            set current_period_spend_cents = 0,
                is_paused = false,
                updated_at = now()
            where date_trunc('month', updated_at) < date_trunc('month', now())
              and (current_period_spend_cents <> 0 or is_paused)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_check_carries_cap_amount() {
        let check = SpendCapCheck::Paused {
            cap_amount_cents: 10_000,
        };
        match check {
            SpendCapCheck::Paused { cap_amount_cents } => assert_eq!(cap_amount_cents, 10_000),
            SpendCapCheck::Ok => panic!("expected Paused"),
        }
    }
}
