//! Relaydl Policy
//!
//! Access gate: channel membership plus per-day quota.

use chrono::NaiveDate;
use relaydl_config::Config;
use relaydl_ipc::ChatTransport;
use relaydl_storage::{Storage, UserRecord};
use std::fmt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    Unlimited,
    PerDay(u32),
}

impl QuotaLimit {
    pub fn from_option(limit: Option<u32>) -> Self {
        limit.map_or(QuotaLimit::Unlimited, QuotaLimit::PerDay)
    }

    pub fn is_exhausted(&self, used: u32) -> bool {
        match self {
            QuotaLimit::Unlimited => false,
            QuotaLimit::PerDay(limit) => used >= *limit,
        }
    }
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaLimit::Unlimited => write!(f, "unlimited"),
            QuotaLimit::PerDay(limit) => write!(f, "{} per day", limit),
        }
    }
}

/// Immutable gate settings resolved from configuration at startup.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub required_channels: Vec<String>,
    pub daily_limit: QuotaLimit,
    pub vip_limit: QuotaLimit,
}

impl GatePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            required_channels: config
                .access
                .required_channels
                .iter()
                .map(|c| normalize_channel(c))
                .collect(),
            daily_limit: QuotaLimit::from_option(config.quota.daily_limit),
            vip_limit: QuotaLimit::from_option(config.quota.vip_limit),
        }
    }

    pub fn applicable_limit(&self, record: &UserRecord, today: NaiveDate) -> QuotaLimit {
        if record.is_vip(today) {
            self.vip_limit
        } else {
            self.daily_limit
        }
    }
}

/// Public usernames get an `@` prefix; numeric chat ids are kept as-is.
pub fn normalize_channel(channel: &str) -> String {
    let channel = channel.trim();
    if channel.starts_with('@') || channel.starts_with('-') || channel.parse::<i64>().is_ok() {
        channel.to_string()
    } else {
        format!("@{}", channel)
    }
}

fn join_link(channel: &str) -> Option<String> {
    channel
        .strip_prefix('@')
        .map(|name| format!("https://t.me/{}", name))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    NotSubscribed { channels: Vec<String> },
    QuotaExceeded { limit: u32 },
    /// The quota store could not be consulted.
    Unavailable,
}

impl Denial {
    pub fn message(&self) -> String {
        match self {
            Denial::NotSubscribed { channels } => {
                let mut text =
                    String::from("⚠️ To use this bot you must join the following channels:\n\n");
                for channel in channels {
                    match join_link(channel) {
                        Some(link) => text.push_str(&format!("👉 {}\n", link)),
                        None => text.push_str(&format!("👉 {}\n", channel)),
                    }
                }
                text.push_str("\nThen send /start again.");
                text
            }
            Denial::QuotaExceeded { limit } => format!(
                "⛔ You reached your daily limit of {} downloads. Try again tomorrow.",
                limit
            ),
            Denial::Unavailable => {
                "⚠️ The service is temporarily unavailable. Please try again later.".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(Denial),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct AccessGate {
    policy: GatePolicy,
}

impl AccessGate {
    pub fn new(policy: GatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Subscription first, then quota. Never fails: store and transport errors
    /// become denials.
    pub async fn check(
        &self,
        transport: &dyn ChatTransport,
        storage: &Mutex<Storage>,
        user_id: i64,
        today: NaiveDate,
    ) -> Admission {
        if let Some(denial) = self.check_subscription(transport, user_id).await {
            return Admission::Denied(denial);
        }

        let storage = storage.lock().await;
        self.check_quota(&storage, user_id, today)
    }

    /// Returns a denial if the user is missing from any required channel.
    /// A failed membership query counts as missing.
    pub async fn check_subscription(
        &self,
        transport: &dyn ChatTransport,
        user_id: i64,
    ) -> Option<Denial> {
        for channel in &self.policy.required_channels {
            let subscribed = match transport.chat_member_status(channel, user_id).await {
                Ok(status) => status.is_subscribed(),
                Err(e) => {
                    warn!(user_id, channel = %channel, "Membership check failed: {}", e);
                    false
                }
            };
            if !subscribed {
                return Some(Denial::NotSubscribed {
                    channels: self.policy.required_channels.clone(),
                });
            }
        }
        None
    }

    pub fn check_quota(&self, storage: &Storage, user_id: i64, today: NaiveDate) -> Admission {
        match self.load_fresh_record(storage, user_id, today) {
            Ok(record) => match self.policy.applicable_limit(&record, today) {
                QuotaLimit::PerDay(limit) if record.downloads_today >= limit => {
                    Admission::Denied(Denial::QuotaExceeded { limit })
                }
                _ => Admission::Allowed,
            },
            Err(e) => {
                warn!(user_id, "Quota check failed: {}", e);
                Admission::Denied(Denial::Unavailable)
            }
        }
    }

    fn load_fresh_record(
        &self,
        storage: &Storage,
        user_id: i64,
        today: NaiveDate,
    ) -> anyhow::Result<UserRecord> {
        storage.ensure_user(user_id, today)?;
        storage.reset_if_new_day(user_id, today)?;
        storage
            .get_user(user_id)?
            .ok_or_else(|| anyhow::anyhow!("user {} missing after ensure_user", user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaydl_config::VipMode;
    use relaydl_ipc::{ChatAction, Keyboard, MemberStatus};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MembershipOnly {
        statuses: HashMap<String, &'static str>,
        failing: Vec<String>,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl ChatTransport for MembershipOnly {
        async fn chat_member_status(
            &self,
            channel: &str,
            _user_id: i64,
        ) -> anyhow::Result<MemberStatus> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.failing.iter().any(|c| c == channel) {
                anyhow::bail!("Bad Request: member list is inaccessible");
            }
            Ok(MemberStatus::parse(
                self.statuses.get(channel).copied().unwrap_or("member"),
            ))
        }

        async fn send_text(
            &self,
            _chat_id: i64,
            _text: &str,
            _keyboard: Option<&Keyboard>,
        ) -> anyhow::Result<Option<i64>> {
            Ok(None)
        }

        async fn edit_text(&self, _: i64, _: i64, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn answer_callback(&self, _: &str, _: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_chat_action(&self, _: i64, _: ChatAction) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_video(&self, _: i64, _: &Path, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_audio(&self, _: i64, _: &Path, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send_document(&self, _: i64, _: &Path, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn gate(channels: &[&str], daily: Option<u32>, vip: Option<u32>) -> AccessGate {
        AccessGate::new(GatePolicy {
            required_channels: channels.iter().map(|c| normalize_channel(c)).collect(),
            daily_limit: QuotaLimit::from_option(daily),
            vip_limit: QuotaLimit::from_option(vip),
        })
    }

    #[test]
    fn normalize_channel_keeps_numeric_ids() {
        assert_eq!(normalize_channel("news"), "@news");
        assert_eq!(normalize_channel(" @news "), "@news");
        assert_eq!(normalize_channel("-1001234567890"), "-1001234567890");
    }

    #[test]
    fn not_subscribed_message_lists_every_channel() {
        let denial = Denial::NotSubscribed {
            channels: vec!["@one".to_string(), "@two".to_string(), "-100".to_string()],
        };
        let text = denial.message();
        assert!(text.contains("https://t.me/one"));
        assert!(text.contains("https://t.me/two"));
        assert!(text.contains("-100"));
    }

    #[tokio::test]
    async fn left_in_any_channel_denies() {
        let transport = MembershipOnly {
            statuses: HashMap::from([("@two".to_string(), "left")]),
            ..Default::default()
        };
        let storage = Mutex::new(Storage::open_in_memory().expect("storage"));
        let gate = gate(&["one", "two"], None, None);

        let admission = gate.check(&transport, &storage, 1, day(2026, 1, 1)).await;
        assert_eq!(
            admission,
            Admission::Denied(Denial::NotSubscribed {
                channels: vec!["@one".to_string(), "@two".to_string()]
            })
        );
    }

    #[tokio::test]
    async fn membership_query_failure_fails_closed() {
        let transport = MembershipOnly {
            failing: vec!["@private".to_string()],
            ..Default::default()
        };
        let storage = Mutex::new(Storage::open_in_memory().expect("storage"));
        let gate = gate(&["private"], None, None);

        let admission = gate.check(&transport, &storage, 1, day(2026, 1, 1)).await;
        assert!(matches!(
            admission,
            Admission::Denied(Denial::NotSubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn unlimited_quota_always_allows_and_creates_user() {
        let transport = MembershipOnly::default();
        let storage = Mutex::new(Storage::open_in_memory().expect("storage"));
        let gate = gate(&[], None, None);

        for _ in 0..3 {
            storage.lock().await.ensure_user(9, day(2026, 1, 1)).expect("ensure");
            storage.lock().await.increment(9).expect("increment");
        }
        let admission = gate.check(&transport, &storage, 9, day(2026, 1, 1)).await;
        assert!(admission.is_allowed());
        assert_eq!(transport.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn denies_at_daily_limit_and_resets_next_day() {
        let transport = MembershipOnly::default();
        let storage = Mutex::new(Storage::open_in_memory().expect("storage"));
        let gate = gate(&[], Some(2), Some(10));
        let today = day(2026, 6, 1);

        assert!(gate.check(&transport, &storage, 3, today).await.is_allowed());
        storage.lock().await.increment(3).expect("increment");
        assert!(gate.check(&transport, &storage, 3, today).await.is_allowed());
        storage.lock().await.increment(3).expect("increment");

        assert_eq!(
            gate.check(&transport, &storage, 3, today).await,
            Admission::Denied(Denial::QuotaExceeded { limit: 2 })
        );

        let tomorrow = day(2026, 6, 2);
        assert!(gate.check(&transport, &storage, 3, tomorrow).await.is_allowed());
        let record = storage.lock().await.get_user(3).expect("query").expect("record");
        assert_eq!(record.downloads_today, 0);
    }

    #[tokio::test]
    async fn vip_limit_applies_until_expiry_day_inclusive() {
        let transport = MembershipOnly::default();
        let storage = Mutex::new(Storage::open_in_memory().expect("storage"));
        let gate = gate(&[], Some(1), Some(3));
        let today = day(2026, 6, 1);

        {
            let store = storage.lock().await;
            store.ensure_user(4, today).expect("ensure");
            store
                .activate_vip(4, 0, today, VipMode::Overwrite)
                .expect("vip");
            store.increment(4).expect("increment");
            store.increment(4).expect("increment");
        }
        // vip_until == today still counts as VIP.
        assert!(gate.check(&transport, &storage, 4, today).await.is_allowed());

        storage.lock().await.increment(4).expect("increment");
        assert_eq!(
            gate.check(&transport, &storage, 4, today).await,
            Admission::Denied(Denial::QuotaExceeded { limit: 3 })
        );
    }

    #[test]
    fn quota_limit_display() {
        assert_eq!(QuotaLimit::Unlimited.to_string(), "unlimited");
        assert_eq!(QuotaLimit::PerDay(5).to_string(), "5 per day");
        assert!(QuotaLimit::PerDay(5).is_exhausted(5));
        assert!(!QuotaLimit::Unlimited.is_exhausted(u32::MAX));
    }
}
