pub mod sqlite;

pub use sqlite::SqliteStore;

/// KV namespaces. Every durable record lives under one of these.
pub const NS_BOTS: &str = "bots";
pub const NS_USERS: &str = "users";
pub const NS_NOTIFICATIONS: &str = "notifications";
pub const NS_BOT_PORTFOLIOS: &str = "bot_portfolios";
pub const NS_PROFILE_PORTFOLIOS: &str = "profile_portfolios";
pub const NS_GLOBALS: &str = "globals";
pub const NS_AUTH: &str = "auth";
pub const NS_TOKEN_TRANSACTIONS: &str = "token_transactions";

/// How long a lock acquire retries before giving up, and how long a held
/// lock survives before it is reclaimable from a crashed holder.
pub const LOCK_TIMEOUT_SECS: i64 = 10;
