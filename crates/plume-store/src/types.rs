//! Store types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Status shared by posts (aggregate) and publish attempts (per channel).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    /// Waiting to be delivered.
    #[default]
    Pending,
    /// Delivered to the channel.
    Published,
    /// Delivery failed terminally.
    Error,
    /// Canceled by the user before delivery.
    Canceled,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublishStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

impl ToSql for PublishStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PublishStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Tenant and owner a request is made on behalf of.
///
/// Every orchestrator-facing query is filtered by both; a post outside the
/// scope is indistinguishable from a missing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub owner_id: String,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            owner_id: owner_id.into(),
        }
    }
}

/// A unit of content scheduled for one or more channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub tenant_id: String,
    pub owner_id: String,
    pub content: Option<String>,
    pub media: Vec<String>,
    pub channels: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: PublishStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The delivery record for one channel of a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishAttempt {
    pub id: String,
    pub post_id: String,
    pub channel: String,
    pub status: PublishStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub error: Option<String>,
    /// Set while a worker holds the attempt; expires on its own after a crash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a post.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub scope: Scope,
    pub content: Option<String>,
    pub media: Vec<String>,
    pub channels: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// Partial update of a pending post. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct PostPatch {
    /// Blank text clears the post's text.
    pub content: Option<String>,
    pub media: Option<Vec<String>>,
    pub channels: Option<Vec<String>>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Listing filter with 1-based pagination.
#[derive(Debug, Clone)]
pub struct PostFilter {
    pub status: Option<PublishStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for PostFilter {
    fn default() -> Self {
        Self {
            status: None,
            from: None,
            to: None,
            page: 1,
            page_size: 20,
        }
    }
}

impl PostFilter {
    /// Maximum page size accepted by listings.
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub(crate) fn limit_offset(&self) -> (i64, i64) {
        let size = self.page_size.clamp(1, Self::MAX_PAGE_SIZE) as i64;
        let page = self.page.max(1) as i64;
        (size, (page - 1) * size)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Derive a post's aggregate status from its attempts.
///
/// A canceled post stays canceled. Otherwise any failed attempt makes the
/// post `error`, any attempt still waiting keeps it `pending`, and a post is
/// `published` only once every remaining attempt has been delivered. A post
/// with no attempts keeps its current status.
pub fn roll_up<I>(current: PublishStatus, attempts: I) -> PublishStatus
where
    I: IntoIterator<Item = PublishStatus>,
{
    if current == PublishStatus::Canceled {
        return current;
    }

    let (mut pending, mut published, mut failed) = (false, false, false);
    for status in attempts {
        match status {
            PublishStatus::Pending => pending = true,
            PublishStatus::Published => published = true,
            PublishStatus::Error => failed = true,
            PublishStatus::Canceled => {}
        }
    }

    if failed {
        PublishStatus::Error
    } else if pending {
        PublishStatus::Pending
    } else if published {
        PublishStatus::Published
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use PublishStatus::*;

    fn status() -> impl Strategy<Value = PublishStatus> {
        prop_oneof![Just(Pending), Just(Published), Just(Error), Just(Canceled)]
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for s in [Pending, Published, Error, Canceled] {
            assert_eq!(s.as_str().parse::<PublishStatus>().unwrap(), s);
        }
        assert!("done".parse::<PublishStatus>().is_err());
    }

    #[test]
    fn test_roll_up_error_wins_over_pending() {
        // One channel failed while another is still waiting
        assert_eq!(roll_up(Pending, [Error, Pending]), Error);
    }

    #[test]
    fn test_roll_up_waits_for_all_channels() {
        assert_eq!(roll_up(Pending, [Published, Pending]), Pending);
        assert_eq!(roll_up(Pending, [Published, Published]), Published);
    }

    #[test]
    fn test_roll_up_keeps_canceled() {
        assert_eq!(roll_up(Canceled, [Published, Published]), Canceled);
    }

    #[test]
    fn test_roll_up_recovers_after_retry() {
        // The failed attempt was reset to pending by a retry
        assert_eq!(roll_up(Error, [Pending, Published]), Pending);
    }

    #[test]
    fn test_filter_limit_offset_clamps() {
        let filter = PostFilter {
            page: 0,
            page_size: 1000,
            ..Default::default()
        };
        assert_eq!(filter.limit_offset(), (100, 0));

        let filter = PostFilter {
            page: 3,
            page_size: 10,
            ..Default::default()
        };
        assert_eq!(filter.limit_offset(), (10, 20));
    }

    proptest! {
        // Published iff nothing is pending or failed and something was delivered
        #[test]
        fn published_iff_all_delivered(
            attempts in prop::collection::vec(prop_oneof![Just(Pending), Just(Published), Just(Error)], 1..6),
        ) {
            let rolled = roll_up(Pending, attempts.iter().copied());
            let all_published = attempts.iter().all(|s| *s == Published);
            prop_assert_eq!(rolled == Published, all_published);
        }

        #[test]
        fn any_error_means_error(
            attempts in prop::collection::vec(status(), 0..6),
            current in prop_oneof![Just(Pending), Just(Error), Just(Published)],
        ) {
            let rolled = roll_up(current, attempts.iter().copied());
            if attempts.contains(&Error) {
                prop_assert_eq!(rolled, Error);
            } else if attempts.iter().any(|s| matches!(s, Pending | Published)) {
                prop_assert_ne!(rolled, Error);
            }
        }

        #[test]
        fn canceled_is_sticky(attempts in prop::collection::vec(status(), 0..6)) {
            prop_assert_eq!(roll_up(Canceled, attempts), Canceled);
        }
    }
}
