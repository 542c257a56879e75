use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use cron::Schedule;

use crate::notify::EventCategory;

const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const DEFAULT_STATE_FILE: &str = "/tmp/guerite_state.json";
const DEFAULT_PUSHOVER_API: &str = "https://api.pushover.net/1/messages.json";
const DEFAULT_NOTIFICATIONS: &str = "update";

const DEFAULT_HEALTH_BACKOFF_SECONDS: u64 = 300;
const DEFAULT_HEALTH_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_ACTION_COOLDOWN_SECONDS: u64 = 60;
const DEFAULT_RESTART_RETRY_LIMIT: u32 = 3;
const DEFAULT_STOP_TIMEOUT_SECONDS: i64 = 10;
const DEFAULT_ROLLBACK_GRACE_SECONDS: u64 = 3600;
const DEFAULT_PRUNE_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_HOOK_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_START_GRACE_SECONDS: u64 = 60;

/// Label keys Guerite recognizes on containers. Every key can be renamed
/// through the matching `GUERITE_*_LABEL` environment variable.
#[derive(Debug, Clone)]
pub struct Labels {
    pub update: String,
    pub restart: String,
    pub recreate: String,
    pub health_check: String,
    pub depends_on: String,
    pub scope: String,
    pub monitor_only: String,
    pub no_pull: String,
    pub no_restart: String,
    pub pre_check: String,
    pub pre_update: String,
    pub post_update: String,
    pub post_check: String,
}

impl Labels {
    fn from_env() -> Self {
        Self {
            update: env_str("GUERITE_UPDATE_LABEL", "guerite.update"),
            restart: env_str("GUERITE_RESTART_LABEL", "guerite.restart"),
            recreate: env_str("GUERITE_RECREATE_LABEL", "guerite.recreate"),
            health_check: env_str("GUERITE_HEALTH_CHECK_LABEL", "guerite.health_check"),
            depends_on: env_str("GUERITE_DEPENDS_LABEL", "guerite.depends_on"),
            scope: env_str("GUERITE_SCOPE_LABEL", "guerite.scope"),
            monitor_only: env_str("GUERITE_MONITOR_ONLY_LABEL", "guerite.monitor_only"),
            no_pull: env_str("GUERITE_NO_PULL_LABEL", "guerite.no_pull"),
            no_restart: env_str("GUERITE_NO_RESTART_LABEL", "guerite.no_restart"),
            pre_check: env_str("GUERITE_PRE_CHECK_LABEL", "guerite.lifecycle.pre_check"),
            pre_update: env_str("GUERITE_PRE_UPDATE_LABEL", "guerite.lifecycle.pre_update"),
            post_update: env_str("GUERITE_POST_UPDATE_LABEL", "guerite.lifecycle.post_update"),
            post_check: env_str("GUERITE_POST_CHECK_LABEL", "guerite.lifecycle.post_check"),
        }
    }

    /// The four action labels whose presence makes a container monitored.
    pub fn action_labels(&self) -> [&str; 4] {
        [
            self.update.as_str(),
            self.restart.as_str(),
            self.recreate.as_str(),
            self.health_check.as_str(),
        ]
    }

    /// Label key carrying the timeout override for a hook label,
    /// e.g. `guerite.lifecycle.pre_check_timeout_seconds`.
    pub fn hook_timeout_key(hook_label: &str) -> String {
        format!("{hook_label}_timeout_seconds")
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub docker_host: String,
    pub timezone: chrono_tz::Tz,
    pub state_file: PathBuf,
    pub labels: Labels,

    pub health_backoff_seconds: u64,
    pub health_timeout_seconds: u64,
    pub action_cooldown_seconds: u64,
    pub restart_retry_limit: u32,
    pub stop_timeout_seconds: i64,
    pub rollback_grace_seconds: u64,
    pub prune_timeout_seconds: u64,
    pub hook_timeout_seconds: u64,
    pub start_grace_seconds: u64,

    pub prune_cron: Option<Schedule>,
    pub notifications: HashSet<EventCategory>,

    pub dry_run: bool,
    pub monitor_only: bool,
    pub no_pull: bool,
    pub no_restart: bool,
    pub rolling_restart: bool,
    pub run_once: bool,

    pub scope: Option<String>,
    pub include_containers: HashSet<String>,
    pub exclude_containers: HashSet<String>,

    pub http_api: bool,
    pub http_api_host: String,
    pub http_api_port: u16,
    pub http_api_token: Option<String>,
    pub http_api_metrics: bool,

    pub pushover_token: Option<String>,
    pub pushover_user: Option<String>,
    pub pushover_api: String,
    pub webhook_url: Option<String>,

    pub log_level: String,
    pub hostname: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid GUERITE_TZ {0:?}")]
    Timezone(String),
    #[error("invalid GUERITE_PRUNE_CRON {expr:?}: {source}")]
    PruneCron {
        expr: String,
        source: crate::cron::CronParseError,
    },
}

impl Settings {
    pub fn try_init() -> Result<Self, ConfigError> {
        let tz_name = env_str("GUERITE_TZ", "UTC");
        let timezone =
            chrono_tz::Tz::from_str(&tz_name).map_err(|_| ConfigError::Timezone(tz_name))?;

        let prune_cron = match env_opt("GUERITE_PRUNE_CRON") {
            Some(expr) => Some(
                crate::cron::parse_five_field(&expr)
                    .map_err(|source| ConfigError::PruneCron { expr, source })?,
            ),
            None => None,
        };

        Ok(Self {
            docker_host: env_str("DOCKER_HOST", DEFAULT_DOCKER_HOST),
            timezone,
            state_file: PathBuf::from(env_str("GUERITE_STATE_FILE", DEFAULT_STATE_FILE)),
            labels: Labels::from_env(),
            health_backoff_seconds: env_u64(
                "GUERITE_HEALTH_CHECK_BACKOFF_SECONDS",
                DEFAULT_HEALTH_BACKOFF_SECONDS,
            ),
            health_timeout_seconds: env_u64(
                "GUERITE_HEALTH_CHECK_TIMEOUT_SECONDS",
                DEFAULT_HEALTH_TIMEOUT_SECONDS,
            ),
            action_cooldown_seconds: env_u64(
                "GUERITE_ACTION_COOLDOWN_SECONDS",
                DEFAULT_ACTION_COOLDOWN_SECONDS,
            ),
            restart_retry_limit: env_u64(
                "GUERITE_RESTART_RETRY_LIMIT",
                u64::from(DEFAULT_RESTART_RETRY_LIMIT),
            ) as u32,
            stop_timeout_seconds: env_i64(
                "GUERITE_STOP_TIMEOUT_SECONDS",
                DEFAULT_STOP_TIMEOUT_SECONDS,
            ),
            rollback_grace_seconds: env_u64(
                "GUERITE_ROLLBACK_GRACE_SECONDS",
                DEFAULT_ROLLBACK_GRACE_SECONDS,
            ),
            prune_timeout_seconds: env_u64(
                "GUERITE_PRUNE_TIMEOUT_SECONDS",
                DEFAULT_PRUNE_TIMEOUT_SECONDS,
            ),
            hook_timeout_seconds: env_u64(
                "GUERITE_HOOK_TIMEOUT_SECONDS",
                DEFAULT_HOOK_TIMEOUT_SECONDS,
            ),
            start_grace_seconds: env_u64("GUERITE_START_GRACE_SECONDS", DEFAULT_START_GRACE_SECONDS),
            prune_cron,
            notifications: parse_notifications(&env_str(
                "GUERITE_NOTIFICATIONS",
                DEFAULT_NOTIFICATIONS,
            )),
            dry_run: env_bool("GUERITE_DRY_RUN", false),
            monitor_only: env_bool("GUERITE_MONITOR_ONLY", false),
            no_pull: env_bool("GUERITE_NO_PULL", false),
            no_restart: env_bool("GUERITE_NO_RESTART", false),
            rolling_restart: env_bool("GUERITE_ROLLING_RESTART", false),
            run_once: env_bool("GUERITE_RUN_ONCE", false),
            scope: env_opt("GUERITE_SCOPE"),
            include_containers: parse_name_set(env_opt("GUERITE_INCLUDE_CONTAINERS").as_deref()),
            exclude_containers: parse_name_set(env_opt("GUERITE_EXCLUDE_CONTAINERS").as_deref()),
            http_api: env_bool("GUERITE_HTTP_API", false),
            http_api_host: env_str("GUERITE_HTTP_API_HOST", "0.0.0.0"),
            http_api_port: env_u64("GUERITE_HTTP_API_PORT", 8080) as u16,
            http_api_token: env_opt("GUERITE_HTTP_API_TOKEN"),
            http_api_metrics: env_bool("GUERITE_HTTP_API_METRICS", false),
            pushover_token: env_opt("GUERITE_PUSHOVER_TOKEN"),
            pushover_user: env_opt("GUERITE_PUSHOVER_USER"),
            pushover_api: env_str("GUERITE_PUSHOVER_API", DEFAULT_PUSHOVER_API),
            webhook_url: env_opt("GUERITE_WEBHOOK_URL"),
            log_level: env_str("GUERITE_LOG_LEVEL", "info").to_lowercase(),
            hostname: env_opt("GUERITE_HOSTNAME").unwrap_or_else(system_hostname),
        })
    }
}

fn system_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_name_set(raw: Option<&str>) -> HashSet<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_notifications(raw: &str) -> HashSet<EventCategory> {
    let mut enabled = HashSet::new();
    for item in raw.split(',') {
        let item = item.trim().to_lowercase();
        if item.is_empty() {
            continue;
        }
        if item == "all" {
            return EventCategory::ALL.iter().copied().collect();
        }
        match EventCategory::from_str(&item) {
            Ok(category) => {
                enabled.insert(category);
            }
            Err(_) => log::warn!("Unknown notification category {item:?}; ignoring"),
        }
    }
    enabled
}
