//! User-facing texts

use chrono::NaiveDate;
use relaydl_policy::QuotaLimit;
use relaydl_storage::{UsageStats, UserRecord};

pub const PROMPT_INPUT: &str = "✳️ Send a link or type the name of a song or video.";
pub const SEARCHING: &str = "🔎 Searching…";
pub const DOWNLOADING: &str = "⏳ Downloading and processing…";
pub const SENT: &str = "✅ Sent.";
pub const NOT_REGISTERED: &str = "You are not registered yet. Send a link or a name to start.";
pub const ADMIN_ONLY: &str = "⛔ This command is for the bot admin only.";
pub const VIP_USAGE: &str = "Usage: /vip <user_id> <days>";
pub const BROADCAST_USAGE: &str = "Usage: /broadcast <text>";

pub fn welcome() -> String {
    "👋 Welcome!\n\nSend me a link from YouTube or another supported site, or just type \
     what you are looking for, and I will send you the file."
        .to_string()
}

pub fn help() -> String {
    [
        "How to use:",
        "• Send a video link, or type a song/video name to search.",
        "• Pick video quality or audio from the buttons.",
        "",
        "Commands:",
        "/start - start the bot",
        "/me - your usage and VIP status",
        "/help - this message",
    ]
    .join("\n")
}

pub fn unknown_command(name: &str) -> String {
    format!("Unknown command /{}. Send /help for usage.", name)
}

pub fn profile(record: &UserRecord, limit: QuotaLimit, today: NaiveDate) -> String {
    let vip = match record.vip_until {
        Some(until) if until >= today => format!("until {}", until),
        Some(until) => format!("expired on {}", until),
        None => "not active".to_string(),
    };
    format!(
        "📌 Your info:\n- ID: {}\n- Downloads today: {}\n- Daily limit: {}\n- VIP: {}",
        record.user_id, record.downloads_today, limit, vip
    )
}

pub fn stats(stats: &UsageStats) -> String {
    format!(
        "📊 Stats\n- Users: {}\n- Downloads today: {}\n- Downloads total: {}\n- Active VIPs: {}",
        stats.users, stats.downloads_today, stats.downloads_total, stats.active_vips
    )
}

pub fn vip_granted(user_id: i64, until: NaiveDate) -> String {
    format!("✅ VIP for {} active until {}.", user_id, until)
}

pub fn broadcast_summary(sent: usize, failed: usize) -> String {
    format!("📣 Broadcast done: {} sent, {} failed.", sent, failed)
}
