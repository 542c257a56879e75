//! The action engine: per-container state machines, cooldown and backoff
//! enforcement, dependency-ordered dispatch and cycle orchestration.

mod hooks;
mod prune;
mod swap;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::cron::CronEvaluator;
use crate::engine::{ContainerDetails, EngineClient, HealthState};
use crate::inventory::{Inventory, MonitoredContainer, ProjectGroup};
use crate::metrics::Metrics;
use crate::notify::{short_id, EventCategory, Notifier};
use crate::planner::{self, GateStatus};
use crate::scheduler::{self, ActionKind, Plan};
use crate::state::{BackoffRecord, StateStore};

use prune::PruneOutcome;
use swap::{SwapOutcome, SwapRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Cooldown,
    Backoff,
    Dependency(String),
    RollingDeferred,
    NoHealthcheck,
    WarmingUp,
    HealthRateLimited,
    DryRun,
    Preflight,
    RollbackArtifact,
}

impl SkipReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cooldown => "cooldown",
            Self::Backoff => "backoff",
            Self::Dependency(reason) => reason,
            Self::RollingDeferred => "rolling_deferred",
            Self::NoHealthcheck => "no_healthcheck",
            Self::WarmingUp => "warming_up",
            Self::HealthRateLimited => "health_rate_limited",
            Self::DryRun => "dry_run",
            Self::Preflight => "preflight",
            Self::RollbackArtifact => "rollback_artifact_present",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Swap reached the replacement container under the original name.
    Committed,
    /// In-place restart succeeded.
    Restarted,
    /// Nothing to do (image up to date, detect-only, already healthy).
    NoChange,
    RolledBack,
    Failed { manual_intervention: bool },
    Skipped(SkipReason),
}

impl Outcome {
    fn is_failure(&self) -> bool {
        matches!(self, Self::RolledBack | Self::Failed { .. })
    }
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(String, ActionKind, Outcome)>,
    pub monitored: usize,
}

impl CycleReport {
    pub fn outcome_for(&self, name: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, outcome)| outcome)
    }
}

pub struct ActionEngine<E: EngineClient> {
    engine: Arc<E>,
    settings: Arc<Settings>,
    evaluator: CronEvaluator,
    store: StateStore,
    state: Mutex<HashMap<String, BackoffRecord>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    inventory: Mutex<Inventory>,
    last_tick: Mutex<Option<DateTime<Utc>>>,
    pub notifier: Notifier,
    pub metrics: Metrics,
}

impl<E: EngineClient> ActionEngine<E> {
    pub fn new(engine: Arc<E>, settings: Arc<Settings>) -> Self {
        let store = StateStore::new(settings.state_file.clone());
        let state = store.load();
        Self {
            evaluator: CronEvaluator::new(settings.timezone),
            store,
            state: Mutex::new(state),
            locks: Mutex::new(HashMap::new()),
            inventory: Mutex::new(Inventory::new()),
            last_tick: Mutex::new(None),
            notifier: Notifier::new(&settings),
            metrics: Metrics::new(),
            engine,
            settings,
        }
    }

    /// One pass of the control loop: snapshot, schedule, act, persist.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let window_start = {
            let mut last_tick = self.last_tick.lock().await;
            last_tick.replace(now).unwrap_or(now)
        };
        self.run_cycle_between(window_start, now).await
    }

    pub(crate) async fn run_cycle_between(
        &self,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CycleReport {
        let started = std::time::Instant::now();
        let snapshot = {
            let mut inventory = self.inventory.lock().await;
            match inventory.snapshot(self.engine.as_ref(), &self.settings).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("Could not list containers: {e}; retrying next cycle");
                    self.metrics.cycles.inc();
                    return CycleReport::default();
                }
            }
        };
        for name in &snapshot.detected {
            log::info!("Now monitoring {name}");
            self.notifier.push_detected(name);
        }
        self.metrics.monitored.set(snapshot.total() as i64);

        let peers = self.gate_peers(&snapshot).await;

        let group_results = future::join_all(
            snapshot
                .groups
                .iter()
                .map(|group| self.run_group(group, peers.clone(), window_start, now)),
        )
        .await;

        let mut outcomes: Vec<(String, ActionKind, Outcome)> =
            group_results.into_iter().flatten().collect();

        if let Some(prune_cron) = &self.settings.prune_cron {
            if self.evaluator.fires_between(prune_cron, window_start, now) {
                let outcome = self.run_prune(now).await;
                outcomes.push(("images".to_string(), ActionKind::Prune, outcome));
            }
        }

        self.notifier.flush_detect(now.timestamp()).await;

        self.persist_state().await;
        self.expire_locks(&snapshot.names()).await;

        self.metrics.cycles.inc();
        self.metrics
            .last_cycle_duration
            .set(started.elapsed().as_secs_f64());

        CycleReport {
            outcomes,
            monitored: snapshot.total(),
        }
    }

    /// Details map used by the dependency gate: all monitored containers,
    /// plus a one-shot inspect for dependencies outside the monitored set.
    async fn gate_peers(
        &self,
        snapshot: &crate::inventory::Snapshot,
    ) -> HashMap<String, ContainerDetails> {
        let mut peers: HashMap<String, ContainerDetails> = snapshot
            .groups
            .iter()
            .flat_map(|g| g.containers.iter())
            .map(|c| (c.name().to_string(), c.details.clone()))
            .collect();
        let missing: Vec<String> = snapshot
            .groups
            .iter()
            .flat_map(|g| g.containers.iter())
            .flat_map(|c| c.depends_on.iter())
            .filter(|dep| !peers.contains_key(*dep))
            .cloned()
            .collect();
        for dep in missing {
            if peers.contains_key(&dep) {
                continue;
            }
            match self.engine.inspect_container(&dep).await {
                Ok(details) => {
                    peers.insert(dep, details);
                }
                Err(e) => log::debug!("Dependency {dep} not inspectable: {e}"),
            }
        }
        peers
    }

    async fn run_group(
        &self,
        group: &ProjectGroup,
        mut peers: HashMap<String, ContainerDetails>,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<(String, ActionKind, Outcome)> {
        let order = planner::topo_order(&group.containers);
        let mut plans: HashMap<usize, Plan> = HashMap::new();
        for &idx in &order {
            if let Some(plan) =
                scheduler::resolve(&group.containers[idx], &self.evaluator, window_start, now)
            {
                plans.insert(idx, plan);
            }
        }

        let mut outcomes = Vec::new();

        if self.settings.rolling_restart {
            let swap_candidates: Vec<usize> = plans
                .iter()
                .filter(|(_, plan)| {
                    matches!(plan.kind, ActionKind::Update | ActionKind::Recreate)
                        && !plan.detect_only
                })
                .map(|(&idx, _)| idx)
                .collect();
            if swap_candidates.len() > 1 {
                let state = self.state.lock().await;
                let entries: Vec<(String, i64)> = swap_candidates
                    .iter()
                    .map(|&idx| {
                        let name = group.containers[idx].name().to_string();
                        let last = state.get(&name).map(|r| r.last_action_ts).unwrap_or(0);
                        (name, last)
                    })
                    .collect();
                drop(state);
                let winner = scheduler::rolling_winner(&entries);
                for idx in swap_candidates {
                    let name = group.containers[idx].name().to_string();
                    if Some(&name) != winner.as_ref() {
                        log::info!("{name}: rolling restart caps this cycle; deferred");
                        if let Some(plan) = plans.remove(&idx) {
                            outcomes.push((
                                name,
                                plan.kind,
                                Outcome::Skipped(SkipReason::RollingDeferred),
                            ));
                        }
                    }
                }
            }
        }

        let mut failed_this_cycle: HashSet<String> = HashSet::new();
        for idx in order {
            let container = &group.containers[idx];
            let Some(plan) = plans.get(&idx).copied() else {
                continue;
            };
            let outcome = self
                .run_action(container, plan, &peers, &failed_this_cycle, now)
                .await;
            if outcome.is_failure() {
                failed_this_cycle.insert(container.name().to_string());
            } else if matches!(outcome, Outcome::Committed | Outcome::Restarted) {
                // Dependents later in the order gate on the post-action
                // state, not the pre-cycle snapshot.
                match self.engine.inspect_container(container.name()).await {
                    Ok(details) => {
                        peers.insert(container.name().to_string(), details);
                    }
                    Err(e) => {
                        log::debug!("{}: post-action inspect failed: {e}", container.name())
                    }
                }
            }
            outcomes.push((container.name().to_string(), plan.kind, outcome));
        }
        outcomes
    }

    async fn run_action(
        &self,
        container: &MonitoredContainer,
        plan: Plan,
        peers: &HashMap<String, ContainerDetails>,
        failed_this_cycle: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Outcome {
        let name = container.name().to_string();
        let lock = self.lock_for(&name).await;
        let _guard = lock.lock().await;
        let now_ts = now.timestamp();

        {
            let state = self.state.lock().await;
            if let Some(record) = state.get(&name) {
                if record.in_cooldown(now_ts, self.settings.action_cooldown_seconds) {
                    log::info!("{name}: skipped ({})", SkipReason::Cooldown.as_str());
                    return Outcome::Skipped(SkipReason::Cooldown);
                }
                if record.in_backoff(now_ts) {
                    log::info!(
                        "{name}: skipped ({}); {}s remaining",
                        SkipReason::Backoff.as_str(),
                        record.backoff_until_ts - now_ts
                    );
                    return Outcome::Skipped(SkipReason::Backoff);
                }
            }
        }

        match planner::dependency_gate(container, peers, failed_this_cycle) {
            GateStatus::Ready => {}
            GateStatus::Unready { dependency, reason } => {
                log::info!("{name}: skipped; {reason} ({dependency})");
                return Outcome::Skipped(SkipReason::Dependency(reason));
            }
        }

        if plan.kind == ActionKind::HealthRestart {
            if let Some(outcome) = self.health_restart_guard(container, now, now_ts).await {
                return outcome;
            }
        }

        if self.settings.dry_run && plan.kind != ActionKind::Update {
            log::info!("{name}: dry-run enabled; not running {}", plan.kind.as_ref());
            return Outcome::Skipped(SkipReason::DryRun);
        }

        if !self.settings.dry_run {
            hooks::run(
                self.engine.as_ref(),
                &name,
                container.hooks.pre_check.as_ref(),
                "pre-check",
            )
            .await;
        }

        match plan.kind {
            ActionKind::Update => self.run_update(container, plan, now_ts).await,
            ActionKind::Restart => self.run_restart(container, now_ts).await,
            ActionKind::Recreate | ActionKind::HealthRestart => {
                let target = container.details.spec.image.clone();
                let outcome = swap::execute(
                    self.engine.as_ref(),
                    &self.settings,
                    SwapRequest {
                        kind: plan.kind,
                        container,
                        target_image_ref: target,
                    },
                )
                .await;
                self.finish_swap(container, plan.kind, outcome, now_ts, None)
                    .await
            }
            ActionKind::Prune => unreachable!("prune is not a per-container action"),
        }
    }

    /// HealthRestart preconditions: a declared healthcheck, an actually
    /// unhealthy container, a finished warm-up and an elapsed rate limit.
    async fn health_restart_guard(
        &self,
        container: &MonitoredContainer,
        now: DateTime<Utc>,
        now_ts: i64,
    ) -> Option<Outcome> {
        let name = container.name();
        if !container.details.has_healthcheck {
            log::warn!("{name} has a health_check schedule but no healthcheck; skipping");
            return Some(Outcome::Skipped(SkipReason::NoHealthcheck));
        }
        // Anything that is not reporting healthy (or has no status yet)
        // counts as unhealthy here, including a probe stuck in starting.
        if matches!(
            container.details.health,
            HealthState::None | HealthState::Healthy
        ) {
            log::debug!("{name}: health {}", container.details.health.as_ref());
            return Some(Outcome::NoChange);
        }
        if let Some(started_at) = container.details.started_at {
            let uptime = (now - started_at).num_seconds();
            if uptime < self.settings.start_grace_seconds as i64 {
                log::debug!("{name}: warming up ({uptime}s); skipping health restart");
                return Some(Outcome::Skipped(SkipReason::WarmingUp));
            }
        }
        let state = self.state.lock().await;
        if let Some(record) = state.get(name) {
            let elapsed = now_ts - record.last_health_restart_ts;
            if elapsed < self.settings.health_backoff_seconds as i64 {
                return Some(Outcome::Skipped(SkipReason::HealthRateLimited));
            }
        }
        None
    }

    async fn run_update(
        &self,
        container: &MonitoredContainer,
        plan: Plan,
        now_ts: i64,
    ) -> Outcome {
        let name = container.name();
        let image_ref = container.details.spec.image.clone();
        let old_image_id = container.details.image_id.clone();

        let new_image_id = if plan.no_pull {
            match self.engine.local_image_id(&image_ref).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    log::info!("{name}: no local image for {image_ref}; no-pull set");
                    return Outcome::NoChange;
                }
                Err(e) => {
                    log::error!("{name}: could not inspect local image {image_ref}: {e}");
                    return Outcome::Failed {
                        manual_intervention: false,
                    };
                }
            }
        } else {
            match self.engine.pull_image(&image_ref).await {
                Ok(id) => id,
                Err(e) => {
                    log::error!("{name}: pull of {image_ref} failed: {e}");
                    self.metrics.observe_action(ActionKind::Update, false);
                    self.notifier
                        .emit(
                            EventCategory::Update,
                            format!("{name} update failed"),
                            format!("Pull of {image_ref} failed: {e}"),
                        )
                        .await;
                    return Outcome::Failed {
                        manual_intervention: false,
                    };
                }
            }
        };

        if new_image_id == old_image_id {
            log::debug!("{name} is up-to-date");
            return Outcome::NoChange;
        }

        log::info!(
            "{name}: found new {image_ref} image ({})",
            short_id(&new_image_id)
        );
        if plan.detect_only {
            self.notifier
                .emit(
                    EventCategory::Update,
                    format!("{name} update available"),
                    format!("Found new {image_ref} image ({})", short_id(&new_image_id)),
                )
                .await;
            return Outcome::NoChange;
        }
        if self.settings.dry_run {
            self.notifier
                .emit(
                    EventCategory::Update,
                    format!("{name} update available"),
                    format!("Found new {image_ref} image ({})", short_id(&new_image_id)),
                )
                .await;
            log::info!("{name}: dry-run enabled; not replacing");
            return Outcome::Skipped(SkipReason::DryRun);
        }

        let outcome = swap::execute(
            self.engine.as_ref(),
            &self.settings,
            SwapRequest {
                kind: ActionKind::Update,
                container,
                target_image_ref: image_ref,
            },
        )
        .await;
        self.finish_swap(
            container,
            ActionKind::Update,
            outcome,
            now_ts,
            Some((old_image_id, new_image_id)),
        )
        .await
    }

    async fn run_restart(&self, container: &MonitoredContainer, now_ts: i64) -> Outcome {
        let name = container.name().to_string();
        log::info!("Restarting {name} (scheduled)");
        let stopped = swap::stop_with_escalation(
            self.engine.as_ref(),
            &name,
            self.settings.stop_timeout_seconds,
        )
        .await;
        let result = match stopped {
            Ok(()) => self.engine.start_container(&name).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.record_success(&name, ActionKind::Restart, now_ts).await;
                self.metrics.observe_action(ActionKind::Restart, true);
                self.notifier
                    .emit(
                        EventCategory::Restart,
                        format!("{name} restarted"),
                        format!(
                            "Restarted {name} (scheduled restart) ({})",
                            short_id(&container.details.image_id)
                        ),
                    )
                    .await;
                Outcome::Restarted
            }
            Err(e) => {
                log::error!("Failed to restart {name}: {e}");
                self.record_failure(&name, now_ts).await;
                self.metrics.observe_action(ActionKind::Restart, false);
                self.notifier
                    .emit(
                        EventCategory::Restart,
                        format!("{name} restart failed"),
                        format!("Could not restart {name}: {e}"),
                    )
                    .await;
                Outcome::Failed {
                    manual_intervention: false,
                }
            }
        }
    }

    async fn finish_swap(
        &self,
        container: &MonitoredContainer,
        kind: ActionKind,
        outcome: SwapOutcome,
        now_ts: i64,
        update_images: Option<(String, String)>,
    ) -> Outcome {
        let name = container.name().to_string();
        let category = match kind {
            ActionKind::Update => EventCategory::Update,
            ActionKind::Recreate => EventCategory::Recreate,
            ActionKind::HealthRestart => EventCategory::Health,
            ActionKind::Restart => EventCategory::Restart,
            ActionKind::Prune => EventCategory::Prune,
        };
        match outcome {
            SwapOutcome::Committed => {
                let mut message = match kind {
                    ActionKind::Update => {
                        format!("Updated {name} to {}", container.details.spec.image)
                    }
                    ActionKind::HealthRestart => {
                        format!("Restarted {name} after failed health check")
                    }
                    _ => format!("Recreated {name}"),
                };
                if let Some((old_image_id, new_image_id)) = update_images {
                    message.push_str(&format!(" ({})", short_id(&new_image_id)));
                    if old_image_id != new_image_id {
                        match self.engine.remove_image(&old_image_id).await {
                            Ok(()) => {
                                message
                                    .push_str(&format!("; removed image ({})", short_id(&old_image_id)));
                            }
                            Err(e) => {
                                log::debug!("Could not remove old image {old_image_id}: {e}")
                            }
                        }
                    }
                }
                {
                    let mut state = self.state.lock().await;
                    let record = state.entry(name.clone()).or_default();
                    record.record_success(now_ts);
                    if kind == ActionKind::HealthRestart {
                        record.mark_health_restart(now_ts);
                    }
                }
                self.metrics.observe_action(kind, true);
                let title = match kind {
                    ActionKind::Update => format!("{name} updated"),
                    ActionKind::HealthRestart => format!("{name} health restart"),
                    _ => format!("{name} recreated"),
                };
                self.notifier.emit(category, title, message).await;
                Outcome::Committed
            }
            SwapOutcome::PreflightFailed { path } => {
                log::error!("{name}: {} aborted; missing bind path {path}", kind.as_ref());
                self.metrics.observe_action(kind, false);
                Outcome::Skipped(SkipReason::Preflight)
            }
            SwapOutcome::RolledBack { error } => {
                self.record_failure(&name, now_ts).await;
                // Keep the new backoff window even across a crash before
                // the end-of-cycle commit.
                self.persist_state().await;
                self.metrics.observe_action(kind, false);
                self.metrics.rollbacks.inc();
                self.notifier
                    .emit(
                        category,
                        format!("{name} {} failed", kind.as_ref()),
                        format!("{error}; rolled back to the previous container"),
                    )
                    .await;
                Outcome::RolledBack
            }
            SwapOutcome::Failed {
                error,
                manual_intervention,
            } => {
                self.record_failure(&name, now_ts).await;
                self.metrics.observe_action(kind, false);
                let mut message = error;
                if manual_intervention {
                    message.push_str("; manual_intervention_required");
                }
                self.notifier
                    .emit(category, format!("{name} {} failed", kind.as_ref()), message)
                    .await;
                Outcome::Failed {
                    manual_intervention,
                }
            }
        }
    }

    async fn run_prune(&self, now: DateTime<Utc>) -> Outcome {
        if self.settings.dry_run {
            log::info!("Dry-run enabled; not pruning images");
            return Outcome::Skipped(SkipReason::DryRun);
        }
        match prune::run(self.engine.as_ref(), &self.settings, now.timestamp()).await {
            PruneOutcome::Deferred => Outcome::Skipped(SkipReason::RollbackArtifact),
            PruneOutcome::Pruned {
                reclaimed_bytes,
                removed_artifacts,
            } => {
                self.metrics.observe_action(ActionKind::Prune, true);
                self.notifier
                    .emit(
                        EventCategory::Prune,
                        "image prune completed".to_string(),
                        format!(
                            "Reclaimed {reclaimed_bytes} bytes; removed {removed_artifacts} stale artifacts"
                        ),
                    )
                    .await;
                Outcome::NoChange
            }
            PruneOutcome::Failed(error) => {
                self.metrics.observe_action(ActionKind::Prune, false);
                self.notifier
                    .emit(
                        EventCategory::Prune,
                        "image prune failed".to_string(),
                        error,
                    )
                    .await;
                Outcome::Failed {
                    manual_intervention: false,
                }
            }
        }
    }

    async fn record_success(&self, name: &str, kind: ActionKind, now_ts: i64) {
        let mut state = self.state.lock().await;
        let record = state.entry(name.to_string()).or_default();
        record.record_success(now_ts);
        if kind == ActionKind::HealthRestart {
            record.mark_health_restart(now_ts);
        }
    }

    async fn record_failure(&self, name: &str, now_ts: i64) {
        let mut state = self.state.lock().await;
        let record = state.entry(name.to_string()).or_default();
        record.record_failure(
            now_ts,
            self.settings.action_cooldown_seconds,
            self.settings.restart_retry_limit,
        );
    }

    async fn persist_state(&self) {
        let state = self.state.lock().await;
        if let Err(e) = self.store.commit(&state) {
            log::warn!("Could not persist state: {e}; continuing with in-memory state");
        }
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop per-name mutexes for containers that no longer exist so the
    /// map cannot grow without bound.
    async fn expire_locks(&self, live_names: &[String]) {
        let mut locks = self.locks.lock().await;
        locks.retain(|name, _| live_names.iter().any(|live| live == name));
    }

    #[cfg(test)]
    pub async fn backoff_record(&self, name: &str) -> Option<BackoffRecord> {
        self.state.lock().await.get(name).cloned()
    }
}
