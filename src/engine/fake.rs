//! In-memory engine double for unit tests. Records every call and lets
//! tests script pull results, health sequences and targeted failures.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ContainerBrief, ContainerDetails, CreateSpec, EngineClient, EngineError, HealthState,
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    ListContainers { all: bool },
    Inspect(String),
    Pull(String),
    LocalImageId(String),
    Create(String),
    Rename { from: String, to: String },
    Start(String),
    Stop { name: String, timeout: i64 },
    Kill(String),
    RemoveContainer(String),
    RemoveImage(String),
    HealthStatus(String),
    Exec { name: String, command: String },
    PruneImages,
}

impl EngineCall {
    /// True for calls that mutate engine state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::ListContainers { .. }
                | Self::Inspect(_)
                | Self::LocalImageId(_)
                | Self::HealthStatus(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub details: ContainerDetails,
    pub created_ts: i64,
}

#[derive(Default)]
pub struct FakeState {
    pub containers: HashMap<String, FakeContainer>,
    pub calls: Vec<EngineCall>,
    /// Pull results by reference: image id on success, message on failure.
    pub pulls: HashMap<String, Result<String, String>>,
    pub local_images: HashMap<String, String>,
    /// Scripted health answers per name, consumed front to back; when
    /// exhausted the container's snapshot health is returned.
    pub health_script: HashMap<String, Vec<HealthState>>,
    /// (op, name) pairs that fail with an API error.
    pub fail: HashSet<(&'static str, String)>,
    /// Names whose next N stop calls time out.
    pub stop_timeouts: HashMap<String, u32>,
    pub exec_exit_code: i64,
    pub prune_reclaimed: i64,
}

#[derive(Default)]
pub struct FakeEngine {
    pub state: Mutex<FakeState>,
}

/// A details value with sensible defaults for tests.
pub fn container(name: &str, image_ref: &str, image_id: &str) -> ContainerDetails {
    ContainerDetails {
        id: format!("id-{name}"),
        name: name.to_string(),
        image_ref: image_ref.to_string(),
        image_id: image_id.to_string(),
        labels: HashMap::new(),
        links: Vec::new(),
        running: true,
        started_at: Some(chrono::Utc::now() - chrono::Duration::hours(1)),
        health: HealthState::None,
        has_healthcheck: false,
        mounts: Vec::new(),
        spec: CreateSpec {
            image: image_ref.to_string(),
            ..Default::default()
        },
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, details: ContainerDetails) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(
            details.name.clone(),
            FakeContainer {
                details,
                created_ts: 0,
            },
        );
    }

    pub fn add_with_created(&self, details: ContainerDetails, created_ts: i64) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(
            details.name.clone(),
            FakeContainer {
                details,
                created_ts,
            },
        );
    }

    pub fn set_pull(&self, reference: &str, result: Result<&str, &str>) {
        self.state.lock().unwrap().pulls.insert(
            reference.to_string(),
            result.map(str::to_string).map_err(str::to_string),
        );
    }

    pub fn script_health(&self, name: &str, sequence: Vec<HealthState>) {
        self.state
            .lock()
            .unwrap()
            .health_script
            .insert(name.to_string(), sequence);
    }

    pub fn fail_on(&self, op: &'static str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail
            .insert((op, name.to_string()));
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutation_calls(&self) -> Vec<EngineCall> {
        self.calls()
            .into_iter()
            .filter(EngineCall::is_mutation)
            .collect()
    }

    pub fn running(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.details.running)
            .unwrap_or(false)
    }

    pub fn image_id_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.details.image_id.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// `fail_on(op, "*")` fails the operation for any name, which is how
    /// tests target the randomly suffixed swap artifacts.
    fn check_fail(state: &FakeState, op: &'static str, name: &str) -> Result<(), EngineError> {
        if state.fail.contains(&(op, name.to_string())) || state.fail.contains(&(op, "*".to_string()))
        {
            return Err(EngineError::Api {
                op,
                message: format!("forced failure for {name}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerBrief>, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::ListContainers { all });
        let mut rows: Vec<ContainerBrief> = state
            .containers
            .values()
            .filter(|c| all || c.details.running)
            .map(|c| ContainerBrief {
                id: c.details.id.clone(),
                name: c.details.name.clone(),
                image_ref: c.details.image_ref.clone(),
                image_id: c.details.image_id.clone(),
                labels: c.details.labels.clone(),
                running: c.details.running,
                created_ts: c.created_ts,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerDetails, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Inspect(name.to_string()));
        state
            .containers
            .get(name)
            .map(|c| c.details.clone())
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn pull_image(&self, reference: &str) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Pull(reference.to_string()));
        match state.pulls.get(reference) {
            Some(Ok(image_id)) => Ok(image_id.clone()),
            Some(Err(message)) => Err(EngineError::Api {
                op: "pull image",
                message: message.clone(),
            }),
            None => Err(EngineError::NotFound(reference.to_string())),
        }
    }

    async fn local_image_id(&self, reference: &str) -> Result<Option<String>, EngineError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(EngineCall::LocalImageId(reference.to_string()));
        Ok(state.local_images.get(reference).cloned())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &CreateSpec,
    ) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Create(name.to_string()));
        Self::check_fail(&state, "create", name)?;
        let mut details = container(name, &spec.image, &spec.image);
        details.running = false;
        details.started_at = None;
        details.has_healthcheck = spec.healthcheck.is_some();
        details.health = if spec.healthcheck.is_some() {
            HealthState::Starting
        } else {
            HealthState::None
        };
        details.labels = spec.labels.clone();
        details.spec = spec.clone();
        // Resolve the image reference to a concrete id when scripted.
        if let Some(Ok(image_id)) = state.pulls.get(&spec.image) {
            details.image_id = image_id.clone();
        } else if let Some(image_id) = state.local_images.get(&spec.image) {
            details.image_id = image_id.clone();
        }
        let id = details.id.clone();
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                details,
                created_ts: 0,
            },
        );
        Ok(id)
    }

    async fn rename_container(&self, name: &str, new_name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Rename {
            from: name.to_string(),
            to: new_name.to_string(),
        });
        Self::check_fail(&state, "rename", name)?;
        let mut entry = state
            .containers
            .remove(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        entry.details.name = new_name.to_string();
        state.containers.insert(new_name.to_string(), entry);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Start(name.to_string()));
        Self::check_fail(&state, "start", name)?;
        let entry = state
            .containers
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        entry.details.running = true;
        entry.details.started_at = Some(chrono::Utc::now());
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout_seconds: i64) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Stop {
            name: name.to_string(),
            timeout: timeout_seconds,
        });
        Self::check_fail(&state, "stop", name)?;
        if let Some(remaining) = state.stop_timeouts.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Timeout {
                    op: "stop container",
                });
            }
        }
        let entry = state
            .containers
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        entry.details.running = false;
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Kill(name.to_string()));
        let entry = state
            .containers
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        entry.details.running = false;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(EngineCall::RemoveContainer(name.to_string()));
        Self::check_fail(&state, "remove_container", name)?;
        state
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn remove_image(&self, image: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::RemoveImage(image.to_string()));
        Self::check_fail(&state, "remove_image", image)?;
        Ok(())
    }

    async fn health_status(&self, name: &str) -> Result<HealthState, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::HealthStatus(name.to_string()));
        let scripted = state
            .health_script
            .get_mut(name)
            .and_then(|script| (!script.is_empty()).then(|| script.remove(0)));
        if let Some(status) = scripted {
            // The status sticks, so later inspects see the transition.
            if let Some(entry) = state.containers.get_mut(name) {
                entry.details.health = status;
            }
            return Ok(status);
        }
        state
            .containers
            .get(name)
            .map(|c| c.details.health)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn exec_in_container(
        &self,
        name: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<i64, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::Exec {
            name: name.to_string(),
            command: command.to_string(),
        });
        Self::check_fail(&state, "exec", name)?;
        Ok(state.exec_exit_code)
    }

    async fn prune_images(&self, _timeout: Duration) -> Result<i64, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(EngineCall::PruneImages);
        Self::check_fail(&state, "prune", "")?;
        Ok(state.prune_reclaimed)
    }
}
