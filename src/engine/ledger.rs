use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{BookingError, Engine};

// ── Subscription-hour arithmetic ─────────────────────────────────

pub fn minutes_to_hours(minutes: u32) -> f64 {
    minutes as f64 / 60.0
}

pub fn remaining_hours(m: &Membership) -> f64 {
    m.total_hours - m.utilized_hours
}

/// Unused quota in whole minutes. Hours are only ever added in whole
/// minutes, so rounding recovers the exact balance.
pub fn remaining_minutes(m: &Membership) -> i64 {
    (remaining_hours(m) * 60.0).round() as i64
}

/// `used + hours`, snapped to the nearest minute.
pub fn add_hours(used: f64, hours: f64) -> f64 {
    ((used + hours) * 60.0).round() / 60.0
}

/// Subscriber with at least `minutes` of unused hours.
pub fn has_quota(m: &Membership, minutes: u32) -> bool {
    m.is_subscriber && remaining_minutes(m) >= i64::from(minutes)
}

/// Subscriber whose plan has not lapsed by `date`. A plan with no expiry
/// never lapses.
pub fn is_valid_for(m: &Membership, date: DateTime<Utc>) -> bool {
    m.is_subscriber && m.expires_at.is_none_or(|exp| exp >= date)
}

/// Subscriber who has used every hour.
pub fn is_exhausted(m: &Membership) -> bool {
    m.is_subscriber && remaining_minutes(m) <= 0
}

fn validate_membership(m: &Membership) -> Result<(), BookingError> {
    if !m.total_hours.is_finite() || !m.utilized_hours.is_finite() {
        return Err(BookingError::Validation("hours must be finite".into()));
    }
    if m.total_hours < 0.0 || m.utilized_hours < 0.0 {
        return Err(BookingError::Validation("hours must not be negative".into()));
    }
    if m.total_hours > MAX_SUBSCRIPTION_HOURS {
        return Err(BookingError::LimitExceeded("subscription hours too large"));
    }
    if m.is_subscriber && m.utilized_hours > m.total_hours {
        return Err(BookingError::Validation(
            "utilized hours exceed total hours".into(),
        ));
    }
    if let Some(tier) = &m.tier
        && tier.len() > MAX_TIER_LEN
    {
        return Err(BookingError::LimitExceeded("tier name too long"));
    }
    Ok(())
}

impl Engine {
    /// Grant, renew or revoke a user's subscription. Replaces the whole record.
    pub async fn set_membership(
        &self,
        user_id: Ulid,
        membership: Membership,
    ) -> Result<Membership, BookingError> {
        validate_membership(&membership)?;
        if !self.users.contains_key(&user_id) {
            return Err(BookingError::NotFound(user_id));
        }
        let _gate = self.compaction_gate.read().await;
        let event = Event::MembershipSet {
            user_id,
            membership: membership.clone(),
        };

        loop {
            let (shared, created) = match self.memberships.entry(user_id) {
                Entry::Occupied(e) => (e.get().clone(), false),
                Entry::Vacant(e) => {
                    let shared = Arc::new(RwLock::new(Membership::default()));
                    e.insert(shared.clone());
                    (shared, true)
                }
            };
            let mut guard = shared.clone().write_owned().await;
            // A failed first grant may have unlinked this record while we waited.
            let linked = self
                .memberships
                .get(&user_id)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &shared));
            if !linked {
                continue;
            }
            if let Err(e) = self.persist_and_apply(None, Some(&mut *guard), &event).await {
                if created {
                    self.memberships
                        .remove_if(&user_id, |_, m| Arc::ptr_eq(m, &shared));
                }
                return Err(e);
            }
            break;
        }
        info!(
            %user_id,
            total = membership.total_hours,
            used = membership.utilized_hours,
            "membership set"
        );
        Ok(membership)
    }

    pub async fn get_membership(&self, user_id: &Ulid) -> Option<Membership> {
        let shared = self.membership_state(user_id)?;
        let guard = shared.read().await;
        Some(guard.clone())
    }

    /// Take `minutes` worth of hours off a subscriber's ledger. Check and
    /// write happen under the membership's write lock.
    pub async fn deduct_hours(&self, user_id: Ulid, minutes: u32) -> Result<Membership, BookingError> {
        if minutes == 0 {
            return Err(BookingError::Validation("minutes must be positive".into()));
        }
        let _gate = self.compaction_gate.read().await;
        let shared = self
            .membership_state(&user_id)
            .ok_or(BookingError::NotFound(user_id))?;
        let mut guard = shared.write_owned().await;
        if !has_quota(&guard, minutes) {
            metrics::counter!(crate::observability::QUOTA_REJECTIONS_TOTAL).increment(1);
            return Err(BookingError::QuotaExceeded {
                available: remaining_hours(&guard).max(0.0),
                required: minutes_to_hours(minutes),
            });
        }
        let event = Event::HoursDeducted {
            deduction: Deduction {
                user_id,
                hours: minutes_to_hours(minutes),
            },
        };
        self.persist_and_apply(None, Some(&mut *guard), &event).await?;
        info!(%user_id, minutes, "subscription hours deducted");
        Ok(guard.clone())
    }
}
