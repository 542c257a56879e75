//! Scheduled image pruning, gated on rollback artifacts.
//!
//! Artifacts younger than the grace window mean a swap may still need its
//! rollback half, so pruning is deferred. Older artifacts are leftovers of
//! interrupted swaps and are removed before the image prune runs.

use std::time::Duration;

use crate::config::Settings;
use crate::engine::EngineClient;
use crate::inventory::is_guerite_artifact;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum PruneOutcome {
    Deferred,
    Pruned {
        reclaimed_bytes: i64,
        removed_artifacts: usize,
    },
    Failed(String),
}

pub(super) async fn run<E: EngineClient>(
    engine: &E,
    settings: &Settings,
    now_ts: i64,
) -> PruneOutcome {
    let rows = match engine.list_containers(true).await {
        Ok(rows) => rows,
        Err(e) => return PruneOutcome::Failed(format!("list containers: {e}")),
    };

    let grace = settings.rollback_grace_seconds as i64;
    let artifacts: Vec<_> = rows
        .into_iter()
        .filter(|row| is_guerite_artifact(&row.name))
        .collect();
    if artifacts
        .iter()
        .any(|row| now_ts.saturating_sub(row.created_ts) < grace)
    {
        log::info!("Prune deferred: rollback_artifact_present");
        return PruneOutcome::Deferred;
    }

    let mut removed_artifacts = 0;
    for artifact in &artifacts {
        log::info!(
            "Removing stale swap artifact {} (older than {grace}s)",
            artifact.name
        );
        if let Err(e) = engine.stop_container(&artifact.name, 5).await {
            if !e.is_not_found() {
                log::debug!("Stopping stale artifact {}: {e}", artifact.name);
            }
        }
        match engine.remove_container(&artifact.name).await {
            Ok(()) => removed_artifacts += 1,
            Err(e) => log::warn!("Could not remove stale artifact {}: {e}", artifact.name),
        }
    }

    match engine
        .prune_images(Duration::from_secs(settings.prune_timeout_seconds))
        .await
    {
        Ok(reclaimed_bytes) => PruneOutcome::Pruned {
            reclaimed_bytes,
            removed_artifacts,
        },
        Err(e) => PruneOutcome::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{self, EngineCall, FakeEngine};

    fn settings() -> Settings {
        Settings::try_init().unwrap()
    }

    #[tokio::test]
    async fn test_young_artifact_defers_prune() {
        let engine = FakeEngine::new();
        engine.add_with_created(
            fake::container("web-guerite-old-deadbeef", "nginx:1.25", "sha256:aaa"),
            990,
        );
        let outcome = run(&engine, &settings(), 1000).await;
        assert_eq!(outcome, PruneOutcome::Deferred);
        assert!(!engine.calls().contains(&EngineCall::PruneImages));
    }

    #[tokio::test]
    async fn test_stale_artifacts_are_removed_then_images_pruned() {
        let engine = FakeEngine::new();
        engine.add_with_created(
            fake::container("web-guerite-old-deadbeef", "nginx:1.25", "sha256:aaa"),
            100,
        );
        engine.state.lock().unwrap().prune_reclaimed = 2048;
        let now = 100 + settings().rollback_grace_seconds as i64 + 1;
        let outcome = run(&engine, &settings(), now).await;
        assert_eq!(
            outcome,
            PruneOutcome::Pruned {
                reclaimed_bytes: 2048,
                removed_artifacts: 1
            }
        );
        assert!(!engine.names().iter().any(|n| n.contains("-guerite-old-")));
        assert!(engine.calls().contains(&EngineCall::PruneImages));
    }

    #[tokio::test]
    async fn test_no_artifacts_prunes_immediately() {
        let engine = FakeEngine::new();
        engine.add(fake::container("web", "nginx:1.25", "sha256:aaa"));
        let outcome = run(&engine, &settings(), 1000).await;
        assert_eq!(
            outcome,
            PruneOutcome::Pruned {
                reclaimed_bytes: 0,
                removed_artifacts: 0
            }
        );
    }

    #[tokio::test]
    async fn test_prune_failure_is_reported() {
        let engine = FakeEngine::new();
        engine.fail_on("prune", "");
        let outcome = run(&engine, &settings(), 1000).await;
        assert!(matches!(outcome, PruneOutcome::Failed(_)));
    }
}
