//! Slash commands: user commands and admin-only quota management

use crate::messages;
use crate::orchestrator::{Orchestrator, Outcome};
use anyhow::Result;
use relaydl_policy::Denial;
use std::time::Duration;
use tracing::{info, warn};

/// Gap between broadcast messages, keeping under Telegram's ~30 msg/s limit.
pub(crate) const BROADCAST_PACING: Duration = Duration::from_millis(50);

impl Orchestrator {
    pub(crate) async fn handle_command(
        &self,
        user_id: i64,
        chat_id: i64,
        name: &str,
        args: &[String],
        raw_args: &str,
    ) -> Result<Outcome> {
        let reply = match name {
            "start" => self.start(user_id).await,
            "help" => messages::help(),
            "me" => self.profile(user_id).await,
            "stats" | "vip" | "broadcast" if !self.is_admin(user_id) => {
                warn!(user_id, command = name, "Refused admin command");
                messages::ADMIN_ONLY.to_string()
            }
            "stats" => self.stats().await,
            "vip" => self.grant_vip(args).await,
            "broadcast" => self.broadcast(raw_args).await,
            other => messages::unknown_command(other),
        };

        self.transport.send_text(chat_id, &reply, None).await?;
        Ok(Outcome::Replied)
    }

    fn is_admin(&self, user_id: i64) -> bool {
        self.admin_id == Some(user_id)
    }

    async fn start(&self, user_id: i64) -> String {
        if let Some(denial) = self
            .gate
            .check_subscription(self.transport.as_ref(), user_id)
            .await
        {
            return denial.message();
        }
        if let Err(e) = self.storage.lock().await.ensure_user(user_id, self.today()) {
            warn!(user_id, "Failed to register user: {}", e);
            return Denial::Unavailable.message();
        }
        messages::welcome()
    }

    async fn profile(&self, user_id: i64) -> String {
        let today = self.today();
        let storage = self.storage.lock().await;
        if let Err(e) = storage.reset_if_new_day(user_id, today) {
            warn!(user_id, "Failed to refresh counter: {}", e);
        }
        match storage.get_user(user_id) {
            Ok(Some(record)) => {
                let limit = self.gate.policy().applicable_limit(&record, today);
                messages::profile(&record, limit, today)
            }
            Ok(None) => messages::NOT_REGISTERED.to_string(),
            Err(e) => {
                warn!(user_id, "Failed to load user: {}", e);
                Denial::Unavailable.message()
            }
        }
    }

    async fn stats(&self) -> String {
        match self.storage.lock().await.stats(self.today()) {
            Ok(stats) => messages::stats(&stats),
            Err(e) => {
                warn!("Failed to compute stats: {}", e);
                Denial::Unavailable.message()
            }
        }
    }

    async fn grant_vip(&self, args: &[String]) -> String {
        let parsed = match args {
            [user, days] => user
                .parse::<i64>()
                .ok()
                .zip(days.parse::<u32>().ok().filter(|d| *d > 0)),
            _ => None,
        };
        let Some((grantee, days)) = parsed else {
            return messages::VIP_USAGE.to_string();
        };

        let today = self.today();
        let storage = self.storage.lock().await;
        let granted = storage
            .ensure_user(grantee, today)
            .and_then(|_| storage.activate_vip(grantee, days, today, self.vip_mode));
        match granted {
            Ok(Some(until)) => {
                info!(grantee, days, %until, "VIP granted");
                messages::vip_granted(grantee, until)
            }
            Ok(None) => messages::NOT_REGISTERED.to_string(),
            Err(e) => {
                warn!(grantee, "Failed to grant VIP: {}", e);
                Denial::Unavailable.message()
            }
        }
    }

    /// Sends `text` verbatim to every known user. Per-recipient failures
    /// (blocked bot, deleted account) are counted only.
    async fn broadcast(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return messages::BROADCAST_USAGE.to_string();
        }

        let recipients = match self.storage.lock().await.list_user_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to list users: {}", e);
                return Denial::Unavailable.message();
            }
        };

        let (mut sent, mut failed) = (0usize, 0usize);
        for (i, recipient) in recipients.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(BROADCAST_PACING).await;
            }
            match self.transport.send_text(recipient, text, None).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(recipient, "Broadcast delivery failed: {}", e);
                    failed += 1;
                }
            }
        }
        info!(sent, failed, "Broadcast finished");
        messages::broadcast_summary(sent, failed)
    }
}
