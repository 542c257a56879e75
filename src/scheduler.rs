//! Resolves which action, if any, each monitored container runs this cycle.

use chrono::{DateTime, Utc};

use crate::cron::CronEvaluator;
use crate::inventory::MonitoredContainer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Update,
    Restart,
    Recreate,
    HealthRestart,
    Prune,
}

impl AsRef<str> for ActionKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Update => "update",
            Self::Restart => "restart",
            Self::Recreate => "recreate",
            Self::HealthRestart => "health_restart",
            Self::Prune => "prune",
        }
    }
}

/// One resolved action for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub kind: ActionKind,
    /// Check for a new image and report it, but do not replace.
    pub detect_only: bool,
    pub no_pull: bool,
}

/// At most one action kind per container per cycle; when several crons
/// fire in the same window the precedence is
/// Update > Recreate > Restart > HealthRestart.
pub fn resolve(
    container: &MonitoredContainer,
    evaluator: &CronEvaluator,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Option<Plan> {
    let fired = |schedule: &Option<cron::Schedule>| {
        schedule
            .as_ref()
            .map(|s| evaluator.fires_between(s, window_start, window_end))
            .unwrap_or(false)
    };

    let kind = if fired(&container.crons.update) {
        ActionKind::Update
    } else if fired(&container.crons.recreate) {
        ActionKind::Recreate
    } else if fired(&container.crons.restart) {
        ActionKind::Restart
    } else if fired(&container.crons.health_check) {
        ActionKind::HealthRestart
    } else {
        return None;
    };

    if container.monitor_only {
        // Monitor-only still reports newer images, nothing else.
        return Some(Plan {
            kind: ActionKind::Update,
            detect_only: true,
            no_pull: container.no_pull,
        });
    }

    match kind {
        ActionKind::Update => Some(Plan {
            kind,
            detect_only: container.no_restart,
            no_pull: container.no_pull,
        }),
        ActionKind::Recreate | ActionKind::Restart | ActionKind::HealthRestart
            if container.no_restart =>
        {
            log::debug!("{}: {} suppressed by no-restart", container.name(), kind.as_ref());
            None
        }
        _ => Some(Plan {
            kind,
            detect_only: false,
            no_pull: container.no_pull,
        }),
    }
}

/// Rolling-restart winner among a group's swap candidates: the entry with
/// the oldest last action wins, name as tie-breaker, so every candidate
/// makes progress across cycles.
pub fn rolling_winner(candidates: &[(String, i64)]) -> Option<String> {
    candidates
        .iter()
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(name, _)| name.clone())
}
