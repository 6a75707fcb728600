//! Plan usage tracking
//!
//! A single `subscription` row holds the active tier and how many sessions
//! were used in the current calendar month. Usage resets when a new month
//! starts.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rusqlite::{OptionalExtension, params};

use super::{DbPool, LimitsProvider, PlanTier, SubscriptionLimits, parse_datetime};
use crate::{Error, Result};

/// `SQLite`-backed subscription limits
#[derive(Clone)]
pub struct SqliteLimits {
    pool: DbPool,
    default_tier: PlanTier,
}

impl SqliteLimits {
    /// Create limits seeded with `default_tier` when no row exists
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool, default_tier: PlanTier) -> Self {
        Self { pool, default_tier }
    }

    /// Read limits as of `now`, creating or rolling over the usage row
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn current(&self, now: DateTime<Utc>) -> Result<SubscriptionLimits> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let row: Option<(String, u32, String)> = conn
            .query_row(
                "SELECT tier, sessions_used, period_start FROM subscription WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((tier, used, period_start)) = row else {
            conn.execute(
                "INSERT INTO subscription (id, tier, sessions_used, period_start) VALUES (1, ?1, 0, ?2)",
                params![self.default_tier.as_str(), now.to_rfc3339()],
            )?;
            tracing::debug!(tier = %self.default_tier, "subscription row created");
            return Ok(SubscriptionLimits::for_tier(self.default_tier, 0));
        };

        let tier = tier.parse::<PlanTier>()?;
        let period_start = parse_datetime(&period_start);

        if !same_month(period_start, now) {
            conn.execute(
                "UPDATE subscription SET sessions_used = 0, period_start = ?1 WHERE id = 1",
                [now.to_rfc3339()],
            )?;
            tracing::info!(tier = %tier, "new billing month, session usage reset");
            return Ok(SubscriptionLimits::for_tier(tier, 0));
        }

        Ok(SubscriptionLimits::for_tier(tier, used))
    }

    /// Change the active plan, keeping usage
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_tier(&self, tier: PlanTier) -> Result<SubscriptionLimits> {
        let limits = self.current(Utc::now())?;

        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            "UPDATE subscription SET tier = ?1 WHERE id = 1",
            [tier.as_str()],
        )?;

        tracing::info!(from = %limits.tier, to = %tier, "plan changed");
        Ok(SubscriptionLimits::for_tier(tier, limits.sessions_used))
    }

    /// Count one session against the current month
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn increment(&self) -> Result<()> {
        // Rolls the period over first if needed
        self.current(Utc::now())?;

        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            "UPDATE subscription SET sessions_used = sessions_used + 1 WHERE id = 1",
            [],
        )?;

        Ok(())
    }
}

fn same_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

#[async_trait]
impl LimitsProvider for SqliteLimits {
    async fn limits(&self) -> Result<SubscriptionLimits> {
        self.current(Utc::now())
    }

    async fn record_session(&self) -> Result<()> {
        self.increment()
    }
}
