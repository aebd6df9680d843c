// models/subscription.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const SUBSCRIPTION_TERM_DAYS: i64 = 30;
pub const REMINDER_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Plan {
    pub fn rank(&self) -> u8 {
        match self {
            Plan::Free => 0,
            Plan::Basic => 1,
            Plan::Premium => 2,
            Plan::Enterprise => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Premium => "premium",
            Plan::Enterprise => "enterprise",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Cancelled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }
}

/// Embedded in the user document. The resting state is free/inactive;
/// expiry is evaluated lazily so a read past `end_date` deactivates first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub plan: Plan,
    pub status: SubscriptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reminder_sent: bool,
}

impl Default for Subscription {
    fn default() -> Self {
        Subscription {
            plan: Plan::Free,
            status: SubscriptionStatus::Inactive,
            start_date: None,
            end_date: None,
            reminder_sent: false,
        }
    }
}

impl Subscription {
    pub fn activate(&mut self, plan: Plan, days: i64, now: DateTime<Utc>) {
        self.plan = plan;
        self.status = SubscriptionStatus::Active;
        self.start_date = Some(now);
        self.end_date = Some(now + Duration::days(days));
        self.reminder_sent = false;
    }

    /// Resets an active subscription whose term has lapsed. Returns true if a
    /// reset happened so the caller knows to persist it.
    pub fn deactivate_if_expired(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != SubscriptionStatus::Active {
            return false;
        }
        match self.end_date {
            Some(end) if end < now => {
                self.plan = Plan::Free;
                self.status = SubscriptionStatus::Inactive;
                true
            }
            _ => false,
        }
    }

    pub fn has_access(&mut self, now: DateTime<Utc>) -> bool {
        self.deactivate_if_expired(now);
        self.status == SubscriptionStatus::Active
    }

    pub fn has_access_level(&mut self, required: Plan, now: DateTime<Utc>) -> bool {
        self.has_access(now) && self.plan.rank() >= required.rank()
    }

    pub fn is_expiring_soon(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && matches!(self.end_date, Some(end) if end > now && end - now <= Duration::days(REMINDER_WINDOW_DAYS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_until(days_from_now: i64) -> (Subscription, DateTime<Utc>) {
        let now = Utc::now();
        let mut sub = Subscription::default();
        sub.activate(Plan::Premium, 30, now - Duration::days(30 - days_from_now));
        (sub, now)
    }

    #[test]
    fn default_is_free_inactive() {
        let sub = Subscription::default();
        assert_eq!(sub.plan, Plan::Free);
        assert_eq!(sub.status, SubscriptionStatus::Inactive);
        assert!(!sub.reminder_sent);
    }

    #[test]
    fn activate_sets_term_and_resets_reminder() {
        let now = Utc::now();
        let mut sub = Subscription::default();
        sub.reminder_sent = true;
        sub.activate(Plan::Premium, 30, now);

        assert_eq!(sub.plan, Plan::Premium);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.start_date, Some(now));
        assert_eq!(sub.end_date, Some(now + Duration::days(30)));
        assert!(!sub.reminder_sent);
    }

    #[test]
    fn expired_subscription_resets_on_access() {
        let now = Utc::now();
        let mut sub = Subscription::default();
        sub.activate(Plan::Enterprise, 30, now - Duration::days(31));

        assert!(!sub.has_access(now));
        assert_eq!(sub.plan, Plan::Free);
        assert_eq!(sub.status, SubscriptionStatus::Inactive);
    }

    #[test]
    fn deactivate_is_noop_while_still_active() {
        let (mut sub, now) = active_until(10);
        assert!(!sub.deactivate_if_expired(now));
        assert_eq!(sub.plan, Plan::Premium);
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[test]
    fn deactivate_is_noop_for_inactive() {
        let now = Utc::now();
        let mut sub = Subscription::default();
        sub.end_date = Some(now - Duration::days(1));
        assert!(!sub.deactivate_if_expired(now));
    }

    #[test]
    fn access_level_requires_rank_and_validity() {
        let (mut sub, now) = active_until(10);
        assert!(sub.has_access_level(Plan::Basic, now));
        assert!(sub.has_access_level(Plan::Premium, now));
        assert!(!sub.has_access_level(Plan::Enterprise, now));

        let mut expired = Subscription::default();
        expired.activate(Plan::Enterprise, 30, now - Duration::days(40));
        assert!(!expired.has_access_level(Plan::Basic, now));
    }

    #[test]
    fn expiring_soon_window() {
        let (sub, now) = active_until(5);
        assert!(sub.is_expiring_soon(now));

        let (sub, now) = active_until(10);
        assert!(!sub.is_expiring_soon(now));

        let inactive = Subscription::default();
        assert!(!inactive.is_expiring_soon(Utc::now()));
    }

    #[test]
    fn plan_ordering() {
        assert!(Plan::Enterprise.rank() > Plan::Premium.rank());
        assert!(Plan::Premium.rank() > Plan::Basic.rank());
        assert!(Plan::Basic.rank() > Plan::Free.rank());
    }

    #[test]
    fn plan_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Premium).unwrap(), "\"premium\"");
        let parsed: SubscriptionStatus = serde_json::from_str("\"past_due\"").unwrap();
        assert_eq!(parsed, SubscriptionStatus::PastDue);
    }
}
