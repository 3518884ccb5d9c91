// src/models/quota.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionTier {
    Free,
    Premium,
    Pro,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "FREE",
            SubscriptionTier::Premium => "PREMIUM",
            SubscriptionTier::Pro => "PRO",
        }
    }

    /// Monthly message ceiling for a tier whose subscription is active.
    pub fn message_limit(&self) -> i32 {
        match self {
            SubscriptionTier::Free => 25,
            SubscriptionTier::Premium => 300,
            SubscriptionTier::Pro => 700,
        }
    }
}

impl FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(tier: &str) -> Result<Self, Self::Err> {
        match tier.to_ascii_uppercase().as_str() {
            "FREE" => Ok(SubscriptionTier::Free),
            "PREMIUM" => Ok(SubscriptionTier::Premium),
            "PRO" => Ok(SubscriptionTier::Pro),
            other => Err(format!("unknown subscription tier: {}", other)),
        }
    }
}

/// Per-user quota record.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaState {
    pub user_id: String,
    pub tier: SubscriptionTier,
    /// Ceiling stored at the last check; may be stale after a tier change.
    pub message_limit: i32,
    pub messages_used: i32,
    pub period_start: DateTime<Utc>,
    pub subscription_start: Option<DateTime<Utc>>,
    pub subscription_end: Option<DateTime<Utc>>,
}

impl QuotaState {
    pub fn new_free(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            tier: SubscriptionTier::Free,
            message_limit: SubscriptionTier::Free.message_limit(),
            messages_used: 0,
            period_start: now,
            subscription_start: None,
            subscription_end: None,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct QuotaRow {
    pub user_id: String,
    pub tier: String,
    pub message_limit: i32,
    pub messages_used: i32,
    pub period_start: DateTime<Utc>,
    pub subscription_start: Option<DateTime<Utc>>,
    pub subscription_end: Option<DateTime<Utc>>,
}

impl TryFrom<QuotaRow> for QuotaState {
    type Error = String;

    fn try_from(row: QuotaRow) -> Result<Self, Self::Error> {
        Ok(QuotaState {
            user_id: row.user_id,
            tier: row.tier.parse()?,
            message_limit: row.message_limit,
            messages_used: row.messages_used,
            period_start: row.period_start,
            subscription_start: row.subscription_start,
            subscription_end: row.subscription_end,
        })
    }
}

/// Answer to "can this user send another message".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitStatus {
    pub can_send: bool,
    pub remaining: i32,
    pub ceiling: i32,
    pub resets_at: DateTime<Utc>,
    pub is_premium_active: bool,
}
