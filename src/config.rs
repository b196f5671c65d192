//! Runtime settings. Every value is a CLI flag with an environment fallback so
//! the same binary runs under a process manager, a container, or a cron host.

use std::time::Duration;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct SyncSettings {
    /// Messages upserted per batch
    #[arg(long, env = "SYNC_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Messages fetched when a run does not ask for the whole mailbox
    #[arg(long, env = "SYNC_RECENT_LIMIT", default_value_t = 50)]
    pub recent_limit: usize,

    /// Lifetime of the single-flight lock; frees the lock if a holder dies
    #[arg(long, env = "SYNC_LOCK_TTL_SECS", default_value_t = 1800)]
    pub lock_ttl_secs: u64,

    /// Lifetime of the published state snapshot and raw counters
    #[arg(long, env = "SYNC_STATE_TTL_SECS", default_value_t = 3600)]
    pub state_ttl_secs: u64,

    /// Delay after completion before the state is reset to idle
    #[arg(long, env = "SYNC_RESET_DELAY_SECS", default_value_t = 300)]
    pub reset_delay_secs: u64,

    #[arg(long, env = "EMAIL_LIST_TTL_SECS", default_value_t = 300)]
    pub list_ttl_secs: u64,

    #[arg(long, env = "EMAIL_STALE_LIST_TTL_SECS", default_value_t = 86_400)]
    pub stale_list_ttl_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            recent_limit: 50,
            lock_ttl_secs: 1800,
            state_ttl_secs: 3600,
            reset_delay_secs: 300,
            list_ttl_secs: 300,
            stale_list_ttl_secs: 86_400,
        }
    }
}

impl SyncSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_secs(self.reset_delay_secs)
    }

    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }

    pub fn stale_list_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_list_ttl_secs)
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

#[derive(Clone, Args)]
pub struct ImapSettings {
    #[arg(long, env = "IMAP_HOST")]
    pub imap_host: Option<String>,

    #[arg(long, env = "IMAP_PORT", default_value_t = 993)]
    pub imap_port: u16,

    #[arg(long, env = "IMAP_USER")]
    pub imap_user: Option<String>,

    #[arg(long, env = "IMAP_PASSWORD", hide_env_values = true)]
    pub imap_password: Option<String>,

    #[arg(long, env = "IMAP_MAILBOX", default_value = "INBOX")]
    pub imap_mailbox: String,

    /// Accept invalid TLS certificates (self-signed test servers only)
    #[arg(long, env = "IMAP_SKIP_TLS_VERIFY", default_value_t = false)]
    pub imap_skip_tls_verify: bool,
}

#[derive(Clone, Args)]
pub struct ContentSettings {
    /// Base URL of the content store, e.g. https://cms.example.com
    #[arg(long, env = "STRAPI_URL")]
    pub strapi_url: Option<String>,

    #[arg(long, env = "STRAPI_TOKEN", hide_env_values = true)]
    pub strapi_token: Option<String>,

    /// Collection holding email records
    #[arg(long, env = "STRAPI_EMAIL_COLLECTION", default_value = "emails")]
    pub strapi_collection: String,
}

#[derive(Clone, Args)]
pub struct ServerSettings {
    #[arg(long, env = "MAILSYNC_BIND", default_value = "0.0.0.0:3000")]
    pub bind: String,

    /// Shared cache; without it exclusivity is only enforced within this process
    #[arg(long, env = "REDIS_URL", hide_env_values = true)]
    pub redis_url: Option<String>,

    /// Bearer token the cron trigger must present
    #[arg(long, env = "CRON_SECRET", hide_env_values = true)]
    pub cron_secret: Option<String>,

    /// Upper bound on the cron handler's own run time
    #[arg(long, env = "CRON_HANDLER_BUDGET_SECS", default_value_t = 55)]
    pub cron_budget_secs: u64,
}

impl ServerSettings {
    pub fn cron_budget(&self) -> Duration {
        Duration::from_secs(self.cron_budget_secs)
    }
}
