// src/services/quota.rs
// Monthly message allowance per user, anchored to the subscription start day for paying users
use crate::models::quota::{LimitStatus, QuotaRow, QuotaState, SubscriptionTier};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt quota row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait QuotaTracker: Send + Sync {
    /// Applies a pending period reset or ceiling correction before answering.
    async fn check_limit(&self, user_id: &str) -> Result<LimitStatus, QuotaError>;

    async fn increment_usage(&self, user_id: &str) -> Result<(), QuotaError>;
}

pub fn is_premium_active(state: &QuotaState, now: DateTime<Utc>) -> bool {
    matches!(state.tier, SubscriptionTier::Premium | SubscriptionTier::Pro)
        && state.subscription_end.map_or(false, |end| end > now)
}

/// Ceiling from the current tier, ignoring whatever is stored.
pub fn derive_ceiling(state: &QuotaState, now: DateTime<Utc>) -> i32 {
    if is_premium_active(state, now) {
        state.tier.message_limit()
    } else {
        SubscriptionTier::Free.message_limit()
    }
}

/// Day of month the period rolls over on.
pub fn anchor_day(state: &QuotaState, now: DateTime<Utc>) -> u32 {
    if is_premium_active(state, now) {
        state.subscription_start.map(|start| start.day()).unwrap_or(1)
    } else {
        1
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (y, m) = next_month(year, month);
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Anchor day in the given month, clamped to the month's length (31 becomes 28/29/30).
fn anchor_in_month(year: i32, month: u32, anchor: u32) -> NaiveDate {
    let day = anchor.clamp(1, days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).expect("valid calendar date")
}

/// First anchor-day midnight strictly after `from`'s calendar date.
pub fn next_reset_after(from: DateTime<Utc>, anchor: u32) -> DateTime<Utc> {
    let date = from.date_naive();
    let this_month = anchor_in_month(date.year(), date.month(), anchor);
    let target = if this_month > date {
        this_month
    } else {
        let (year, month) = next_month(date.year(), date.month());
        anchor_in_month(year, month, anchor)
    };
    Utc.from_utc_datetime(&target.and_time(chrono::NaiveTime::MIN))
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaChange {
    Reset { ceiling: i32, period_start: DateTime<Utc> },
    Ceiling(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub status: LimitStatus,
    /// Write the tracker must persist before returning `status`.
    pub change: Option<QuotaChange>,
}

pub fn evaluate(state: &QuotaState, now: DateTime<Utc>) -> Evaluation {
    let premium = is_premium_active(state, now);
    let ceiling = derive_ceiling(state, now);
    let anchor = anchor_day(state, now);
    let boundary = next_reset_after(state.period_start, anchor);

    if now >= boundary {
        return Evaluation {
            status: LimitStatus {
                can_send: ceiling > 0,
                remaining: ceiling,
                ceiling,
                resets_at: next_reset_after(now, anchor),
                is_premium_active: premium,
            },
            change: Some(QuotaChange::Reset { ceiling, period_start: now }),
        };
    }

    let remaining = (ceiling - state.messages_used).max(0);
    Evaluation {
        status: LimitStatus {
            can_send: remaining > 0,
            remaining,
            ceiling,
            resets_at: boundary,
            is_premium_active: premium,
        },
        change: (state.message_limit != ceiling).then_some(QuotaChange::Ceiling(ceiling)),
    }
}

impl QuotaState {
    pub fn apply(&mut self, change: &QuotaChange) {
        match change {
            QuotaChange::Reset { ceiling, period_start } => {
                self.messages_used = 0;
                self.period_start = *period_start;
                self.message_limit = *ceiling;
            }
            QuotaChange::Ceiling(ceiling) => self.message_limit = *ceiling,
        }
    }
}

pub struct PgQuotaTracker {
    pool: PgPool,
}

impl PgQuotaTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaTracker for PgQuotaTracker {
    async fn check_limit(&self, user_id: &str) -> Result<LimitStatus, QuotaError> {
        sqlx::query("INSERT INTO user_quotas (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query_as::<_, QuotaRow>(
            r#"
            SELECT user_id, tier, message_limit, messages_used, period_start,
                   subscription_start, subscription_end
            FROM user_quotas WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let state = QuotaState::try_from(row).map_err(QuotaError::Corrupt)?;
        let evaluation = evaluate(&state, Utc::now());

        match &evaluation.change {
            Some(QuotaChange::Reset { ceiling, period_start }) => {
                tracing::info!("Quota period reset for user {} (ceiling {})", user_id, ceiling);
                sqlx::query(
                    "UPDATE user_quotas SET messages_used = 0, period_start = $2, message_limit = $3 WHERE user_id = $1",
                )
                .bind(user_id)
                .bind(period_start)
                .bind(ceiling)
                .execute(&self.pool)
                .await?;
            }
            Some(QuotaChange::Ceiling(ceiling)) => {
                sqlx::query("UPDATE user_quotas SET message_limit = $2 WHERE user_id = $1")
                    .bind(user_id)
                    .bind(ceiling)
                    .execute(&self.pool)
                    .await?;
            }
            None => {}
        }

        Ok(evaluation.status)
    }

    async fn increment_usage(&self, user_id: &str) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            INSERT INTO user_quotas (user_id, messages_used) VALUES ($1, 1)
            ON CONFLICT (user_id) DO UPDATE SET messages_used = user_quotas.messages_used + 1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct InMemoryQuotaTracker {
    states: Mutex<HashMap<String, QuotaState>>,
    clock: Clock,
}

impl Default for InMemoryQuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQuotaTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub async fn set_state(&self, state: QuotaState) {
        self.states.lock().await.insert(state.user_id.clone(), state);
    }

    pub async fn state(&self, user_id: &str) -> Option<QuotaState> {
        self.states.lock().await.get(user_id).cloned()
    }
}

#[async_trait]
impl QuotaTracker for InMemoryQuotaTracker {
    async fn check_limit(&self, user_id: &str) -> Result<LimitStatus, QuotaError> {
        let now = (self.clock)();
        let mut states = self.states.lock().await;
        let state = states
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaState::new_free(user_id, now));

        let evaluation = evaluate(state, now);
        if let Some(change) = &evaluation.change {
            state.apply(change);
        }
        Ok(evaluation.status)
    }

    async fn increment_usage(&self, user_id: &str) -> Result<(), QuotaError> {
        let now = (self.clock)();
        let mut states = self.states.lock().await;
        states
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaState::new_free(user_id, now))
            .messages_used += 1;
        Ok(())
    }
}
