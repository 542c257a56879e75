//! Name-preserving container replacement.
//!
//! The sequence is rename old, create new, stop old, take over the name,
//! start, health-gate, then commit or roll back. Every exit path leaves the
//! host name-stable: the original name points at a running container, or
//! the outcome says manual intervention is required.

use std::path::Path;
use std::time::Duration;

use crate::config::Settings;
use crate::engine::{CreateSpec, EngineClient, EngineError, MountKind};
use crate::inventory::MonitoredContainer;
use crate::scheduler::ActionKind;

use super::hooks;

pub(super) struct SwapRequest<'a> {
    pub kind: ActionKind,
    pub container: &'a MonitoredContainer,
    /// Image reference the replacement is created from.
    pub target_image_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum SwapOutcome {
    Committed,
    /// A bind mount's host path is missing; the action was aborted before
    /// any engine mutation.
    PreflightFailed { path: String },
    RolledBack { error: String },
    Failed { error: String, manual_intervention: bool },
}

pub(super) async fn execute<E: EngineClient>(
    engine: &E,
    settings: &Settings,
    request: SwapRequest<'_>,
) -> SwapOutcome {
    let container = request.container;
    let name = container.name();

    if let Some(path) = missing_bind_path(&container.details.spec) {
        log::error!("{name}: bind mount path {path} does not exist; aborting {}", request.kind.as_ref());
        return SwapOutcome::PreflightFailed { path };
    }
    for mount in &container.details.mounts {
        if mount.kind == MountKind::Volume {
            if let Some(driver) = mount.driver.as_deref() {
                if driver != "local" {
                    log::warn!(
                        "{name}: volume {} at {} uses non-local driver {driver}; continuing",
                        mount.source,
                        mount.destination
                    );
                }
            }
        }
    }

    let suffix = swap_suffix();
    let old_name = format!("{name}-guerite-old-{suffix}");
    let new_name = format!("{name}-guerite-new-{suffix}");

    if let Err(e) = engine.rename_container(name, &old_name).await {
        // Nothing was touched yet.
        return SwapOutcome::Failed {
            error: format!("rename to {old_name}: {e}"),
            manual_intervention: false,
        };
    }

    let mut spec = container.details.spec.clone();
    spec.image = request.target_image_ref.clone();

    if let Err(e) = engine.create_container(&new_name, &spec).await {
        return rollback(
            engine,
            name,
            &old_name,
            None,
            false,
            format!("create {new_name}: {e}"),
        )
        .await;
    }

    hooks::run(engine, &old_name, container.hooks.pre_update.as_ref(), "pre-update").await;

    if let Err(e) = stop_with_escalation(engine, &old_name, settings.stop_timeout_seconds).await {
        return rollback(
            engine,
            name,
            &old_name,
            Some(&new_name),
            false,
            format!("stop {old_name}: {e}"),
        )
        .await;
    }

    if let Err(e) = engine.rename_container(&new_name, name).await {
        return rollback(
            engine,
            name,
            &old_name,
            Some(&new_name),
            true,
            format!("rename {new_name} to {name}: {e}"),
        )
        .await;
    }

    if let Err(e) = engine.start_container(name).await {
        return rollback(
            engine,
            name,
            &old_name,
            Some(name),
            true,
            format!("start {name}: {e}"),
        )
        .await;
    }

    if container.details.spec.healthcheck.is_some() {
        if let Err(error) = probe_health(engine, name, settings).await {
            return rollback(engine, name, &old_name, Some(name), true, error).await;
        }
    }

    hooks::run(engine, name, container.hooks.post_check.as_ref(), "post-check").await;

    if let Err(e) = engine.remove_container(&old_name).await {
        log::warn!("{name}: could not remove {old_name}: {e}; prune will reap it");
    }

    hooks::run(engine, name, container.hooks.post_update.as_ref(), "post-update").await;

    SwapOutcome::Committed
}

/// Stop with the configured timeout; on failure retry once with double the
/// timeout, then force-kill.
pub(super) async fn stop_with_escalation<E: EngineClient>(
    engine: &E,
    name: &str,
    timeout_seconds: i64,
) -> Result<(), EngineError> {
    match engine.stop_container(name, timeout_seconds).await {
        Ok(()) => return Ok(()),
        Err(e) => log::warn!("{name}: stop ({timeout_seconds}s) failed: {e}; retrying"),
    }
    match engine.stop_container(name, timeout_seconds * 2).await {
        Ok(()) => return Ok(()),
        Err(e) => log::warn!("{name}: stop ({}s) failed: {e}; killing", timeout_seconds * 2),
    }
    engine.kill_container(name).await
}

async fn probe_health<E: EngineClient>(
    engine: &E,
    name: &str,
    settings: &Settings,
) -> Result<(), String> {
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(settings.health_timeout_seconds);
    loop {
        match engine.health_status(name).await {
            Ok(crate::engine::HealthState::Healthy) => return Ok(()),
            Ok(status) => {
                log::debug!("{name}: health {}", status.as_ref());
            }
            Err(e) => log::warn!("{name}: health poll failed: {e}"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "not healthy within {}s",
                settings.health_timeout_seconds
            ));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Best-effort return to the pre-swap state. `replacement` names the new
/// container if one exists (under its temporary or final name);
/// `old_stopped` says whether the original was already stopped.
async fn rollback<E: EngineClient>(
    engine: &E,
    name: &str,
    old_name: &str,
    replacement: Option<&str>,
    old_stopped: bool,
    error: String,
) -> SwapOutcome {
    log::error!("{name}: swap failed ({error}); rolling back");
    if let Some(replacement) = replacement {
        if let Err(e) = engine.stop_container(replacement, 5).await {
            log::debug!("{name}: stopping replacement {replacement}: {e}");
        }
        if let Err(e) = engine.remove_container(replacement).await {
            if !e.is_not_found() {
                log::error!("{name}: could not remove replacement {replacement}: {e}");
                return SwapOutcome::Failed {
                    error,
                    manual_intervention: true,
                };
            }
        }
    }
    if let Err(e) = engine.rename_container(old_name, name).await {
        log::error!("{name}: could not rename {old_name} back: {e}");
        return SwapOutcome::Failed {
            error,
            manual_intervention: true,
        };
    }
    if old_stopped {
        if let Err(e) = engine.start_container(name).await {
            log::error!("{name}: could not restart original container: {e}");
            return SwapOutcome::Failed {
                error,
                manual_intervention: true,
            };
        }
    }
    SwapOutcome::RolledBack { error }
}

fn swap_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// First bind mount whose host path is absent, if any. Only absolute host
/// paths are checked; named volumes resolve engine-side.
fn missing_bind_path(spec: &CreateSpec) -> Option<String> {
    for bind in &spec.binds {
        let host_part = bind.split(':').next().unwrap_or_default();
        if host_part.starts_with('/') && !Path::new(host_part).exists() {
            return Some(host_part.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{self, EngineCall, FakeEngine};
    use crate::engine::{HealthState, HealthcheckSpec};
    use crate::inventory::{ActionCrons, HookSet};

    fn settings() -> Settings {
        let mut settings = Settings::try_init().unwrap();
        settings.health_timeout_seconds = 0;
        settings
    }

    fn monitored(details: crate::engine::ContainerDetails) -> MonitoredContainer {
        MonitoredContainer {
            details,
            project: None,
            depends_on: Vec::new(),
            crons: ActionCrons::default(),
            monitor_only: false,
            no_pull: false,
            no_restart: false,
            hooks: HookSet::default(),
        }
    }

    fn healthy_web() -> MonitoredContainer {
        let mut details = fake::container("web", "nginx:1.25", "sha256:aaa");
        details.has_healthcheck = true;
        details.spec.healthcheck = Some(HealthcheckSpec {
            test: vec!["CMD".to_string(), "curl".to_string()],
            ..Default::default()
        });
        monitored(details)
    }

    #[tokio::test]
    async fn test_successful_swap_commits_and_removes_old() {
        let engine = FakeEngine::new();
        let container = healthy_web();
        engine.add(container.details.clone());
        engine.set_pull("nginx:1.25", Ok("sha256:bbb"));
        // The replacement reports healthy on the first probe.
        engine.script_health("web", vec![HealthState::Healthy]);

        let outcome = execute(
            &engine,
            &settings(),
            SwapRequest {
                kind: ActionKind::Update,
                container: &container,
                target_image_ref: "nginx:1.25".to_string(),
            },
        )
        .await;

        assert_eq!(outcome, SwapOutcome::Committed);
        assert_eq!(engine.names(), vec!["web".to_string()]);
        assert!(engine.running("web"));
        assert_eq!(engine.image_id_of("web"), Some("sha256:bbb".to_string()));
    }

    #[tokio::test]
    async fn test_health_timeout_rolls_back_to_original() {
        let engine = FakeEngine::new();
        let container = healthy_web();
        engine.add(container.details.clone());
        engine.set_pull("nginx:1.25", Ok("sha256:bbb"));
        engine.script_health("web", vec![HealthState::Unhealthy]);

        let outcome = execute(
            &engine,
            &settings(),
            SwapRequest {
                kind: ActionKind::Update,
                container: &container,
                target_image_ref: "nginx:1.25".to_string(),
            },
        )
        .await;

        assert!(matches!(outcome, SwapOutcome::RolledBack { .. }));
        assert_eq!(engine.names(), vec!["web".to_string()]);
        assert!(engine.running("web"));
        assert_eq!(engine.image_id_of("web"), Some("sha256:aaa".to_string()));
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back_without_stopping_original() {
        let engine = FakeEngine::new();
        let container = monitored(fake::container("web", "nginx:1.25", "sha256:aaa"));
        engine.add(container.details.clone());
        engine.fail_on("create", "*");

        let outcome = execute(
            &engine,
            &settings(),
            SwapRequest {
                kind: ActionKind::Recreate,
                container: &container,
                target_image_ref: "nginx:1.25".to_string(),
            },
        )
        .await;

        assert!(matches!(outcome, SwapOutcome::RolledBack { .. }));
        assert_eq!(engine.names(), vec!["web".to_string()]);
        // The original was never stopped, only renamed and renamed back.
        assert!(engine.running("web"));
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Stop { name, .. } if name == "web")));
    }

    #[tokio::test]
    async fn test_failed_rollback_reports_manual_intervention() {
        let engine = FakeEngine::new();
        let container = healthy_web();
        engine.add(container.details.clone());
        engine.script_health("web", vec![HealthState::Unhealthy]);
        // The replacement cannot be removed during rollback.
        engine.fail_on("remove_container", "*");

        let outcome = execute(
            &engine,
            &settings(),
            SwapRequest {
                kind: ActionKind::Update,
                container: &container,
                target_image_ref: "nginx:1.25".to_string(),
            },
        )
        .await;

        assert!(matches!(
            outcome,
            SwapOutcome::Failed {
                manual_intervention: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_preflight_missing_bind_path_aborts_before_mutation() {
        let engine = FakeEngine::new();
        let mut details = fake::container("web", "nginx:1.25", "sha256:aaa");
        details.spec.binds = vec!["/definitely/not/a/real/path/xyz:/data".to_string()];
        let container = monitored(details);
        engine.add(container.details.clone());

        let outcome = execute(
            &engine,
            &settings(),
            SwapRequest {
                kind: ActionKind::Update,
                container: &container,
                target_image_ref: "nginx:1.25".to_string(),
            },
        )
        .await;

        assert!(matches!(outcome, SwapOutcome::PreflightFailed { .. }));
        assert!(engine.mutation_calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_escalates_timeout_then_kills() {
        let engine = FakeEngine::new();
        engine.add(fake::container("web", "nginx:1.25", "sha256:aaa"));
        engine
            .state
            .lock()
            .unwrap()
            .stop_timeouts
            .insert("web".to_string(), 2);

        stop_with_escalation(&engine, "web", 10).await.unwrap();

        let calls = engine.calls();
        assert_eq!(
            calls,
            vec![
                EngineCall::Stop {
                    name: "web".to_string(),
                    timeout: 10
                },
                EngineCall::Stop {
                    name: "web".to_string(),
                    timeout: 20
                },
                EngineCall::Kill("web".to_string()),
            ]
        );
        assert!(!engine.running("web"));
    }

    #[tokio::test]
    async fn test_no_healthcheck_swap_commits_without_probe() {
        let engine = FakeEngine::new();
        let container = monitored(fake::container("web", "nginx:1.25", "sha256:aaa"));
        engine.add(container.details.clone());

        let outcome = execute(
            &engine,
            &settings(),
            SwapRequest {
                kind: ActionKind::Recreate,
                container: &container,
                target_image_ref: "nginx:1.25".to_string(),
            },
        )
        .await;

        assert_eq!(outcome, SwapOutcome::Committed);
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::HealthStatus(_))));
    }

    #[tokio::test]
    async fn test_hooks_run_at_their_stations() {
        let engine = FakeEngine::new();
        let mut container = monitored(fake::container("web", "nginx:1.25", "sha256:aaa"));
        container.hooks.pre_update = Some(crate::inventory::Hook {
            command: "prep".to_string(),
            timeout: Duration::from_secs(5),
        });
        container.hooks.post_update = Some(crate::inventory::Hook {
            command: "announce".to_string(),
            timeout: Duration::from_secs(5),
        });
        engine.add(container.details.clone());

        let outcome = execute(
            &engine,
            &settings(),
            SwapRequest {
                kind: ActionKind::Recreate,
                container: &container,
                target_image_ref: "nginx:1.25".to_string(),
            },
        )
        .await;
        assert_eq!(outcome, SwapOutcome::Committed);

        let execs: Vec<String> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Exec { name, command } => Some(format!("{name}:{command}")),
                _ => None,
            })
            .collect();
        // pre-update runs inside the renamed original, post-update inside
        // the committed replacement.
        assert_eq!(execs.len(), 2);
        assert!(execs[0].contains("-guerite-old-"));
        assert!(execs[0].ends_with(":prep"));
        assert_eq!(execs[1], "web:announce");
    }

    #[test]
    fn test_swap_suffix_is_short_token() {
        let a = swap_suffix();
        let b = swap_suffix();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
