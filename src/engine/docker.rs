//! Bollard-backed implementation of the engine capability set.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::models::{
    ContainerInspectResponse, EndpointIpamConfig, EndpointSettings, HealthConfig, HealthStatusEnum,
    HostConfig, MountPointTypeEnum, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::ConnectNetworkOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;

use super::{
    ContainerBrief, ContainerDetails, CreateSpec, EngineClient, EngineError, HealthState,
    HealthcheckSpec, MountInfo, MountKind, NetworkAttachment,
};
use crate::config::Settings;

const CONNECT_TIMEOUT_SECONDS: u64 = 120;
const ENGINE_OP_TIMEOUT_SECONDS: u64 = 60;
const PULL_TIMEOUT_SECONDS: u64 = 600;
const STOP_DEADLINE_MARGIN_SECONDS: u64 = 30;

pub struct DockerEngine {
    docker: Docker,
    op_timeout: Duration,
}

impl DockerEngine {
    pub fn connect(settings: &Settings) -> Result<Self, EngineError> {
        let docker = if settings.docker_host.starts_with("unix://") {
            Docker::connect_with_unix(
                &settings.docker_host,
                CONNECT_TIMEOUT_SECONDS,
                API_DEFAULT_VERSION,
            )
        } else {
            Docker::connect_with_http(
                &settings.docker_host,
                CONNECT_TIMEOUT_SECONDS,
                API_DEFAULT_VERSION,
            )
        }
        .map_err(|e| EngineError::Api {
            op: "connect",
            message: e.to_string(),
        })?;
        Ok(Self {
            docker,
            op_timeout: Duration::from_secs(ENGINE_OP_TIMEOUT_SECONDS),
        })
    }

    /// A cloned handle for tasks that stream outside the capability set
    /// (the Docker event listener).
    pub fn handle(&self) -> Docker {
        self.docker.clone()
    }

    async fn deadline<T, F>(&self, op: &'static str, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        deadline_in(self.op_timeout, op, fut).await
    }
}

async fn deadline_in<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, bollard::errors::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(map_api_error(op, e)),
        Err(_) => Err(EngineError::Timeout { op }),
    }
}

fn map_api_error(op: &'static str, error: bollard::errors::Error) -> EngineError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        other => EngineError::Api {
            op,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl EngineClient for DockerEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerBrief>, EngineError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let rows = self
            .deadline("list containers", self.docker.list_containers(Some(options)))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let name = row
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(ContainerBrief {
                    id: row.id.unwrap_or_default(),
                    name,
                    image_ref: row.image.unwrap_or_default(),
                    image_id: row.image_id.unwrap_or_default(),
                    labels: row.labels.unwrap_or_default(),
                    running: row.state.as_deref() == Some("running"),
                    created_ts: row.created.unwrap_or(0),
                })
            })
            .collect())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerDetails, EngineError> {
        let response = self
            .deadline(
                "inspect container",
                self.docker
                    .inspect_container(name, None::<InspectContainerOptions>),
            )
            .await?;
        Ok(details_from_inspect(response))
    }

    async fn pull_image(&self, reference: &str) -> Result<String, EngineError> {
        let options = CreateImageOptions::<String> {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let docker = &self.docker;
        let drain = async move {
            let mut stream = docker.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                progress?;
            }
            Ok(())
        };
        deadline_in(Duration::from_secs(PULL_TIMEOUT_SECONDS), "pull image", drain).await?;
        let inspected = self
            .deadline("inspect image", self.docker.inspect_image(reference))
            .await?;
        inspected.id.ok_or_else(|| EngineError::Api {
            op: "pull image",
            message: format!("no image id for {reference}"),
        })
    }

    async fn local_image_id(&self, reference: &str) -> Result<Option<String>, EngineError> {
        match self
            .deadline("inspect image", self.docker.inspect_image(reference))
            .await
        {
            Ok(inspected) => Ok(inspected.id),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &CreateSpec,
    ) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let exposed_ports = if spec.exposed_ports.is_empty() {
            None
        } else {
            Some(
                spec.exposed_ports
                    .iter()
                    .map(|port| (port.clone(), HashMap::new()))
                    .collect(),
            )
        };
        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            network_mode: spec.network_mode.clone(),
            restart_policy: spec.restart_policy.as_deref().map(|name| RestartPolicy {
                name: Some(restart_policy_enum(name)),
                ..Default::default()
            }),
            privileged: Some(spec.privileged),
            cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
            ..Default::default()
        };
        let config = Config::<String> {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            labels: Some(spec.labels.clone()),
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            hostname: spec.hostname.clone(),
            domainname: spec.domainname.clone(),
            stop_signal: spec.stop_signal.clone(),
            stop_timeout: spec.stop_timeout,
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            exposed_ports,
            healthcheck: spec.healthcheck.as_ref().map(to_health_config),
            host_config: Some(host_config),
            ..Default::default()
        };
        let created = self
            .deadline(
                "create container",
                self.docker.create_container(Some(options), config),
            )
            .await?;

        // Named endpoints are attached after creation, the way the engine's
        // own clients do it; the network in network_mode is already joined.
        for network in &spec.networks {
            if Some(network.name.as_str()) == spec.network_mode.as_deref() {
                continue;
            }
            let connect = ConnectNetworkOptions {
                container: created.id.clone(),
                endpoint_config: EndpointSettings {
                    aliases: (!network.aliases.is_empty()).then(|| network.aliases.clone()),
                    links: (!network.links.is_empty()).then(|| network.links.clone()),
                    ipam_config: Some(EndpointIpamConfig {
                        ipv4_address: network.ipv4_address.clone(),
                        ipv6_address: network.ipv6_address.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            };
            if let Err(e) = self
                .deadline(
                    "connect network",
                    self.docker.connect_network(&network.name, connect),
                )
                .await
            {
                log::warn!("Could not attach {name} to network {}: {e}", network.name);
            }
        }
        Ok(created.id)
    }

    async fn rename_container(&self, name: &str, new_name: &str) -> Result<(), EngineError> {
        self.deadline(
            "rename container",
            self.docker.rename_container(
                name,
                RenameContainerOptions {
                    name: new_name.to_string(),
                },
            ),
        )
        .await
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.deadline(
            "start container",
            self.docker
                .start_container(name, None::<StartContainerOptions<String>>),
        )
        .await
    }

    async fn stop_container(&self, name: &str, timeout_seconds: i64) -> Result<(), EngineError> {
        let limit =
            Duration::from_secs(timeout_seconds.max(0) as u64 + STOP_DEADLINE_MARGIN_SECONDS);
        deadline_in(
            limit,
            "stop container",
            self.docker
                .stop_container(name, Some(StopContainerOptions { t: timeout_seconds })),
        )
        .await
    }

    async fn kill_container(&self, name: &str) -> Result<(), EngineError> {
        self.deadline(
            "kill container",
            self.docker
                .kill_container(name, None::<KillContainerOptions<String>>),
        )
        .await
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        self.deadline(
            "remove container",
            self.docker.remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            ),
        )
        .await
    }

    async fn remove_image(&self, image: &str) -> Result<(), EngineError> {
        self.deadline(
            "remove image",
            self.docker
                .remove_image(image, None::<RemoveImageOptions>, None),
        )
        .await
        .map(|_| ())
    }

    async fn health_status(&self, name: &str) -> Result<HealthState, EngineError> {
        let response = self
            .deadline(
                "inspect container",
                self.docker
                    .inspect_container(name, None::<InspectContainerOptions>),
            )
            .await?;
        Ok(health_from_inspect(&response))
    }

    async fn exec_in_container(
        &self,
        name: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<i64, EngineError> {
        let run = async {
            let exec = self
                .docker
                .create_exec(
                    name,
                    CreateExecOptions::<String> {
                        cmd: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            command.to_string(),
                        ]),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            if let StartExecResults::Attached { mut output, .. } =
                self.docker.start_exec(&exec.id, None).await?
            {
                while let Some(chunk) = output.next().await {
                    chunk?;
                }
            }
            let inspected = self.docker.inspect_exec(&exec.id).await?;
            Ok(inspected.exit_code.unwrap_or(-1))
        };
        deadline_in(timeout, "exec", run).await
    }

    async fn prune_images(&self, timeout: Duration) -> Result<i64, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["false".to_string()]);
        let response = deadline_in(
            timeout,
            "prune images",
            self.docker.prune_images(Some(PruneImagesOptions { filters })),
        )
        .await?;
        Ok(response.space_reclaimed.unwrap_or(0))
    }
}

fn to_health_config(spec: &HealthcheckSpec) -> HealthConfig {
    HealthConfig {
        test: Some(spec.test.clone()),
        interval: spec.interval_ns,
        timeout: spec.timeout_ns,
        retries: spec.retries,
        start_period: spec.start_period_ns,
        ..Default::default()
    }
}

fn restart_policy_enum(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

fn restart_policy_name(policy: RestartPolicyNameEnum) -> Option<String> {
    let name = match policy {
        RestartPolicyNameEnum::ALWAYS => "always",
        RestartPolicyNameEnum::UNLESS_STOPPED => "unless-stopped",
        RestartPolicyNameEnum::ON_FAILURE => "on-failure",
        RestartPolicyNameEnum::NO => "no",
        RestartPolicyNameEnum::EMPTY => return None,
    };
    Some(name.to_string())
}

fn health_from_inspect(response: &ContainerInspectResponse) -> HealthState {
    let status = response
        .state
        .as_ref()
        .and_then(|state| state.health.as_ref())
        .and_then(|health| health.status);
    match status {
        Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
        Some(HealthStatusEnum::STARTING) => HealthState::Starting,
        Some(HealthStatusEnum::EMPTY) | Some(HealthStatusEnum::NONE) | None => HealthState::None,
    }
}

fn details_from_inspect(response: ContainerInspectResponse) -> ContainerDetails {
    let health = health_from_inspect(&response);
    let name = response
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let config = response.config.unwrap_or_default();
    let host_config = response.host_config.unwrap_or_default();
    let state = response.state.unwrap_or_default();

    let healthcheck = config.healthcheck.as_ref().and_then(|hc| {
        let test = hc.test.clone().unwrap_or_default();
        if test.is_empty() || test.first().map(String::as_str) == Some("NONE") {
            return None;
        }
        Some(HealthcheckSpec {
            test,
            interval_ns: hc.interval,
            timeout_ns: hc.timeout,
            retries: hc.retries,
            start_period_ns: hc.start_period,
        })
    });

    let mut exposed_ports: Vec<String> = config
        .exposed_ports
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();
    exposed_ports.sort();

    let mut networks: Vec<NetworkAttachment> = response
        .network_settings
        .and_then(|settings| settings.networks)
        .map(|networks| {
            networks
                .into_iter()
                .map(|(name, endpoint)| NetworkAttachment {
                    name,
                    aliases: endpoint.aliases.unwrap_or_default(),
                    links: endpoint.links.unwrap_or_default(),
                    ipv4_address: endpoint
                        .ipam_config
                        .as_ref()
                        .and_then(|ipam| ipam.ipv4_address.clone()),
                    ipv6_address: endpoint
                        .ipam_config
                        .as_ref()
                        .and_then(|ipam| ipam.ipv6_address.clone()),
                })
                .collect()
        })
        .unwrap_or_default();
    networks.sort_by(|a, b| a.name.cmp(&b.name));

    let mounts = response
        .mounts
        .unwrap_or_default()
        .into_iter()
        .map(|mount| MountInfo {
            kind: match mount.typ {
                Some(MountPointTypeEnum::BIND) => MountKind::Bind,
                Some(MountPointTypeEnum::VOLUME) => MountKind::Volume,
                _ => MountKind::Other,
            },
            source: mount
                .name
                .or(mount.source)
                .unwrap_or_default(),
            destination: mount.destination.unwrap_or_default(),
            driver: mount.driver,
        })
        .collect();

    let image_ref = config.image.clone().unwrap_or_default();
    let spec = CreateSpec {
        image: image_ref.clone(),
        env: config.env.unwrap_or_default(),
        cmd: config.cmd,
        entrypoint: config.entrypoint,
        labels: config.labels.clone().unwrap_or_default(),
        user: config.user.filter(|u| !u.is_empty()),
        working_dir: config.working_dir.filter(|w| !w.is_empty()),
        hostname: config.hostname.filter(|h| !h.is_empty()),
        domainname: config.domainname.filter(|d| !d.is_empty()),
        stop_signal: config.stop_signal,
        stop_timeout: config.stop_timeout,
        exposed_ports,
        healthcheck,
        tty: config.tty.unwrap_or(false),
        open_stdin: config.open_stdin.unwrap_or(false),
        restart_policy: host_config
            .restart_policy
            .as_ref()
            .and_then(|policy| policy.name)
            .and_then(restart_policy_name),
        binds: host_config.binds.clone().unwrap_or_default(),
        network_mode: host_config.network_mode.clone(),
        privileged: host_config.privileged.unwrap_or(false),
        cap_add: host_config.cap_add.clone().unwrap_or_default(),
        networks,
    };

    ContainerDetails {
        id: response.id.unwrap_or_default(),
        name,
        image_ref,
        image_id: response.image.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        links: host_config.links.unwrap_or_default(),
        running: state.running.unwrap_or(false),
        started_at: state
            .started_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|dt| dt.timestamp() > 0),
        health,
        has_healthcheck: spec.healthcheck.is_some(),
        mounts,
        spec,
    }
}
