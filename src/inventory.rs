//! Builds the monitored-container snapshot for one cycle: label selection,
//! include/exclude/scope filtering, swarm and artifact exclusion, project
//! grouping and new-name detection.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use cron::Schedule;

use crate::config::{Labels, Settings};
use crate::engine::{ContainerDetails, EngineClient, EngineError};

pub const PROJECT_LABEL: &str = "com.docker.compose.project";
const SWARM_LABELS: [&str; 2] = ["com.docker.swarm.service.id", "com.docker.swarm.task.id"];

const OLD_INFIX: &str = "-guerite-old-";
const NEW_INFIX: &str = "-guerite-new-";

/// True for the temporary names a swap leaves on the engine.
pub fn is_guerite_artifact(name: &str) -> bool {
    name.contains(OLD_INFIX) || name.contains(NEW_INFIX)
}

/// Strip any number of swap suffixes, nested or not:
/// `app-guerite-old-x-guerite-new-y` resolves to `app`.
pub fn strip_guerite_suffix(name: &str) -> &str {
    let old = name.find(OLD_INFIX);
    let new = name.find(NEW_INFIX);
    match (old, new) {
        (Some(a), Some(b)) => &name[..a.min(b)],
        (Some(a), None) => &name[..a],
        (None, Some(b)) => &name[..b],
        (None, None) => name,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionCrons {
    pub update: Option<Schedule>,
    pub restart: Option<Schedule>,
    pub recreate: Option<Schedule>,
    pub health_check: Option<Schedule>,
}

#[derive(Debug, Clone)]
pub struct Hook {
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct HookSet {
    pub pre_check: Option<Hook>,
    pub pre_update: Option<Hook>,
    pub post_update: Option<Hook>,
    pub post_check: Option<Hook>,
}

/// Everything the scheduler and action engine need to know about one
/// container, captured at the start of a cycle.
#[derive(Debug, Clone)]
pub struct MonitoredContainer {
    pub details: ContainerDetails,
    pub project: Option<String>,
    pub depends_on: Vec<String>,
    pub crons: ActionCrons,
    pub monitor_only: bool,
    pub no_pull: bool,
    pub no_restart: bool,
    pub hooks: HookSet,
}

impl MonitoredContainer {
    pub fn name(&self) -> &str {
        &self.details.name
    }
}

#[derive(Debug)]
pub struct ProjectGroup {
    pub project: Option<String>,
    pub containers: Vec<MonitoredContainer>,
}

#[derive(Debug)]
pub struct Snapshot {
    pub groups: Vec<ProjectGroup>,
    pub detected: Vec<String>,
}

impl Snapshot {
    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.containers.len()).sum()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .iter()
            .flat_map(|g| g.containers.iter().map(|c| c.name().to_string()))
            .collect();
        names.sort();
        names
    }
}

/// Tracks monitored names across cycles so newly appearing containers can
/// be reported through the detect batch.
#[derive(Debug, Default)]
pub struct Inventory {
    prev_names: HashSet<String>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot<E: EngineClient>(
        &mut self,
        engine: &E,
        settings: &Settings,
    ) -> Result<Snapshot, EngineError> {
        let rows = engine.list_containers(false).await?;
        let mut selected = Vec::new();
        for row in rows {
            if is_guerite_artifact(&row.name) {
                continue;
            }
            let has_action_label = settings
                .labels
                .action_labels()
                .iter()
                .any(|label| row.labels.contains_key(*label));
            if !has_action_label {
                continue;
            }
            if SWARM_LABELS.iter().any(|label| row.labels.contains_key(*label)) {
                log::debug!("Skipping {}; swarm-managed", row.name);
                continue;
            }
            if !settings.include_containers.is_empty()
                && !settings.include_containers.contains(&row.name)
            {
                continue;
            }
            if settings.exclude_containers.contains(&row.name) {
                continue;
            }
            if let Some(scope) = &settings.scope {
                if row.labels.get(&settings.labels.scope) != Some(scope) {
                    log::debug!("Skipping {}; outside scope {scope}", row.name);
                    continue;
                }
            }
            selected.push(row.name);
        }

        let mut containers = Vec::new();
        for name in &selected {
            match engine.inspect_container(name).await {
                Ok(details) => containers.push(monitored_from_details(details, settings)),
                Err(e) => log::warn!("Could not inspect {name}: {e}; skipping this cycle"),
            }
        }

        let names: HashSet<String> = containers.iter().map(|c| c.name().to_string()).collect();
        let mut detected: Vec<String> = names.difference(&self.prev_names).cloned().collect();
        detected.sort();
        self.prev_names = names;

        Ok(Snapshot {
            groups: group_by_project(containers),
            detected,
        })
    }
}

fn group_by_project(containers: Vec<MonitoredContainer>) -> Vec<ProjectGroup> {
    let mut groups: BTreeMap<Option<String>, Vec<MonitoredContainer>> = BTreeMap::new();
    for container in containers {
        // No project label means a singleton group keyed by the name.
        let key = container
            .project
            .clone()
            .or_else(|| Some(format!("\u{0}{}", container.name())));
        groups.entry(key).or_default().push(container);
    }
    groups
        .into_values()
        .map(|mut containers| {
            containers.sort_by(|a, b| a.name().cmp(b.name()));
            let project = containers[0].project.clone();
            ProjectGroup {
                project,
                containers,
            }
        })
        .collect()
}

fn monitored_from_details(details: ContainerDetails, settings: &Settings) -> MonitoredContainer {
    let labels = &settings.labels;
    let crons = ActionCrons {
        update: parse_cron_label(&details, &labels.update),
        restart: parse_cron_label(&details, &labels.restart),
        recreate: parse_cron_label(&details, &labels.recreate),
        health_check: parse_cron_label(&details, &labels.health_check),
    };

    let mut depends_on: Vec<String> = details
        .labels
        .get(&labels.depends_on)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for link in &details.links {
        if let Some(target) = parse_link_target(link) {
            depends_on.push(target);
        }
    }
    depends_on.sort();
    depends_on.dedup();
    depends_on.retain(|dep| dep != &details.name);

    let project = details.labels.get(PROJECT_LABEL).cloned();
    let monitor_only = settings.monitor_only || bool_label(&details, &labels.monitor_only);
    let no_pull = settings.no_pull || bool_label(&details, &labels.no_pull);
    let no_restart = settings.no_restart || bool_label(&details, &labels.no_restart);

    let hooks = HookSet {
        pre_check: hook_from_labels(&details, &labels.pre_check, settings),
        pre_update: hook_from_labels(&details, &labels.pre_update, settings),
        post_update: hook_from_labels(&details, &labels.post_update, settings),
        post_check: hook_from_labels(&details, &labels.post_check, settings),
    };

    MonitoredContainer {
        details,
        project,
        depends_on,
        crons,
        monitor_only,
        no_pull,
        no_restart,
        hooks,
    }
}

fn parse_cron_label(details: &ContainerDetails, label: &str) -> Option<Schedule> {
    let expr = details.labels.get(label)?;
    match crate::cron::parse_five_field(expr) {
        Ok(schedule) => Some(schedule),
        Err(e) => {
            log::warn!("{}: ignoring {label}={expr:?}: {e}", details.name);
            None
        }
    }
}

/// Engine links look like `/db:/web/db`; the dependency is the base name
/// of the first segment.
fn parse_link_target(link: &str) -> Option<String> {
    let target = link.split(':').next()?.trim_start_matches('/');
    if target.is_empty() {
        return None;
    }
    Some(strip_guerite_suffix(target).to_string())
}

fn bool_label(details: &ContainerDetails, label: &str) -> bool {
    details
        .labels
        .get(label)
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn hook_from_labels(
    details: &ContainerDetails,
    label: &str,
    settings: &Settings,
) -> Option<Hook> {
    let command = details.labels.get(label)?.trim().to_string();
    if command.is_empty() {
        return None;
    }
    let timeout_seconds = details
        .labels
        .get(&Labels::hook_timeout_key(label))
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(settings.hook_timeout_seconds);
    Some(Hook {
        command,
        timeout: Duration::from_secs(timeout_seconds),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{self, FakeEngine};

    fn settings() -> Settings {
        Settings::try_init().unwrap()
    }

    fn labeled(name: &str, labels: &[(&str, &str)]) -> ContainerDetails {
        let mut details = fake::container(name, "img:latest", "sha256:aaa");
        for (key, value) in labels {
            details
                .labels
                .insert(key.to_string(), value.to_string());
        }
        details
    }

    #[test]
    fn test_strip_guerite_suffix_handles_nesting() {
        assert_eq!(strip_guerite_suffix("app"), "app");
        assert_eq!(strip_guerite_suffix("app-guerite-old-12345678"), "app");
        assert_eq!(strip_guerite_suffix("app-guerite-new-abcdef12"), "app");
        assert_eq!(
            strip_guerite_suffix("app-guerite-old-deadbeef-guerite-new-12345678"),
            "app"
        );
    }

    #[tokio::test]
    async fn test_only_action_labeled_containers_are_monitored() {
        let engine = FakeEngine::new();
        engine.add(labeled("web", &[("guerite.update", "* * * * *")]));
        engine.add(labeled("plain", &[]));
        let mut inventory = Inventory::new();
        let snapshot = inventory.snapshot(&engine, &settings()).await.unwrap();
        assert_eq!(snapshot.names(), vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_swarm_and_artifact_containers_are_skipped() {
        let engine = FakeEngine::new();
        engine.add(labeled(
            "svc",
            &[
                ("guerite.update", "* * * * *"),
                ("com.docker.swarm.service.id", "x"),
            ],
        ));
        engine.add(labeled(
            "app-guerite-old-deadbeef",
            &[("guerite.update", "* * * * *")],
        ));
        let mut inventory = Inventory::new();
        let snapshot = inventory.snapshot(&engine, &settings()).await.unwrap();
        assert_eq!(snapshot.total(), 0);
    }

    #[tokio::test]
    async fn test_include_exclude_and_scope_filters() {
        let mut settings = settings();
        settings.include_containers = ["web".to_string(), "db".to_string()].into();
        settings.exclude_containers = ["db".to_string()].into();
        settings.scope = Some("prod".to_string());

        let engine = FakeEngine::new();
        engine.add(labeled(
            "web",
            &[("guerite.update", "* * * * *"), ("guerite.scope", "prod")],
        ));
        // Excluded even though included.
        engine.add(labeled(
            "db",
            &[("guerite.update", "* * * * *"), ("guerite.scope", "prod")],
        ));
        // Not in the include list.
        engine.add(labeled(
            "cache",
            &[("guerite.update", "* * * * *"), ("guerite.scope", "prod")],
        ));
        // Wrong scope.
        engine.add(labeled(
            "web2",
            &[("guerite.update", "* * * * *"), ("guerite.scope", "dev")],
        ));

        let mut inventory = Inventory::new();
        let snapshot = inventory.snapshot(&engine, &settings).await.unwrap();
        assert_eq!(snapshot.names(), vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_detect_reports_names_absent_in_previous_cycle() {
        let engine = FakeEngine::new();
        engine.add(labeled("web", &[("guerite.update", "* * * * *")]));
        let mut inventory = Inventory::new();
        let first = inventory.snapshot(&engine, &settings()).await.unwrap();
        assert_eq!(first.detected, vec!["web".to_string()]);

        let second = inventory.snapshot(&engine, &settings()).await.unwrap();
        assert!(second.detected.is_empty());

        engine.add(labeled("db", &[("guerite.restart", "0 3 * * *")]));
        let third = inventory.snapshot(&engine, &settings()).await.unwrap();
        assert_eq!(third.detected, vec!["db".to_string()]);
    }

    #[tokio::test]
    async fn test_grouping_by_project_label() {
        let engine = FakeEngine::new();
        engine.add(labeled(
            "app",
            &[("guerite.update", "* * * * *"), (PROJECT_LABEL, "stack")],
        ));
        engine.add(labeled(
            "db",
            &[("guerite.update", "* * * * *"), (PROJECT_LABEL, "stack")],
        ));
        engine.add(labeled("solo", &[("guerite.update", "* * * * *")]));
        let mut inventory = Inventory::new();
        let snapshot = inventory.snapshot(&engine, &settings()).await.unwrap();
        assert_eq!(snapshot.groups.len(), 2);
        let stack = snapshot
            .groups
            .iter()
            .find(|g| g.project.as_deref() == Some("stack"))
            .unwrap();
        assert_eq!(stack.containers.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_cron_excludes_only_that_action() {
        let engine = FakeEngine::new();
        engine.add(labeled(
            "web",
            &[
                ("guerite.update", "not a cron"),
                ("guerite.restart", "0 3 * * *"),
            ],
        ));
        let mut inventory = Inventory::new();
        let snapshot = inventory.snapshot(&engine, &settings()).await.unwrap();
        let web = &snapshot.groups[0].containers[0];
        assert!(web.crons.update.is_none());
        assert!(web.crons.restart.is_some());
    }

    #[tokio::test]
    async fn test_depends_on_merges_label_and_links() {
        let engine = FakeEngine::new();
        let mut details = labeled(
            "app",
            &[
                ("guerite.update", "* * * * *"),
                ("guerite.depends_on", "db, cache"),
            ],
        );
        details.links = vec!["/db-guerite-old-12345678:/app/db".to_string()];
        engine.add(details);
        let mut inventory = Inventory::new();
        let snapshot = inventory.snapshot(&engine, &settings()).await.unwrap();
        let app = &snapshot.groups[0].containers[0];
        assert_eq!(app.depends_on, vec!["cache".to_string(), "db".to_string()]);
    }

    #[tokio::test]
    async fn test_hook_labels_with_timeout_override() {
        let engine = FakeEngine::new();
        engine.add(labeled(
            "web",
            &[
                ("guerite.update", "* * * * *"),
                ("guerite.lifecycle.pre_update", "backup.sh"),
                ("guerite.lifecycle.pre_update_timeout_seconds", "120"),
            ],
        ));
        let mut inventory = Inventory::new();
        let snapshot = inventory.snapshot(&engine, &settings()).await.unwrap();
        let web = &snapshot.groups[0].containers[0];
        let hook = web.hooks.pre_update.as_ref().unwrap();
        assert_eq!(hook.command, "backup.sh");
        assert_eq!(hook.timeout, Duration::from_secs(120));
        assert!(web.hooks.post_update.is_none());
    }
}
