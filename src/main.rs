use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bollard::system::EventsOptions;
use chrono::Utc;
use futures_util::StreamExt;

use crate::actions::ActionEngine;
use crate::config::Settings;
use crate::cron::CronEvaluator;
use crate::engine::docker::DockerEngine;
use crate::engine::EngineClient;
use crate::inventory::is_guerite_artifact;
use crate::notify::{EventCategory, Notifier};

mod actions;
mod cli;
mod config;
mod cron;
mod engine;
mod http;
mod inventory;
mod metrics;
mod notify;
mod planner;
mod scheduler;
mod signals;
mod state;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Where a cycle request came from; ticks are implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Http,
    Signal,
    Event,
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::try_init() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.log_level),
    )
    .init();

    if let Some(signal) = cli::get_cli_args().signal.clone() {
        return signals::send_signal(signal);
    }

    if cli::get_cli_args().test {
        eprintln!("Guerite config is ok.");
        return ExitCode::SUCCESS;
    }

    log::info!("Guerite running with PID: {}", std::process::id());

    let docker = match DockerEngine::connect(&settings) {
        Ok(docker) => Arc::new(docker),
        Err(e) => {
            log::error!("Unable to connect to Docker: {e}");
            return ExitCode::FAILURE;
        }
    };
    let docker_handle = docker.handle();
    let settings = Arc::new(settings);
    let engine = Arc::new(ActionEngine::new(docker.clone(), settings.clone()));

    if let Err(e) = signals::write_pid_file() {
        log::warn!("Could not write pid file: {e}");
    }

    let (trigger_tx, mut trigger_rx) = tokio::sync::mpsc::channel::<Trigger>(1);
    let shutdown = Arc::new(tokio::sync::Notify::new());
    signals::handle_shutdown(shutdown.clone());
    signals::handle_trigger(trigger_tx.clone());
    start_event_listener(docker_handle, settings.clone(), trigger_tx.clone());

    if settings.http_api {
        let engine = engine.clone();
        let settings = settings.clone();
        let trigger_tx = trigger_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(engine, settings, trigger_tx).await {
                log::error!("HTTP API failed: {e}");
            }
        });
    }

    startup_summary(docker.as_ref(), &settings, &engine.notifier).await;

    if settings.run_once {
        // One pass over the previous minute, then exit.
        let now = Utc::now();
        engine
            .run_cycle_between(now - chrono::Duration::seconds(60), now)
            .await;
        signals::remove_pid_file();
        return ExitCode::SUCCESS;
    }

    loop {
        let report = engine.run_cycle(Utc::now()).await;
        log::debug!(
            "Cycle finished: {} monitored, {} actions",
            report.monitored,
            report.outcomes.len()
        );

        tokio::select! {
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
            trigger = trigger_rx.recv() => {
                if let Some(trigger) = trigger {
                    log::info!("Running checks due to {trigger:?} trigger");
                }
            }
            _ = shutdown.notified() => {
                break;
            }
        }
    }

    signals::remove_pid_file();
    ExitCode::SUCCESS
}

/// Log the next scheduled checks once at startup, and send them out when
/// startup notifications are enabled.
async fn startup_summary<E: EngineClient>(
    engine: &E,
    settings: &Settings,
    notifier: &Notifier,
) {
    let evaluator = CronEvaluator::new(settings.timezone);
    let now = Utc::now();
    let rows = match engine.list_containers(false).await {
        Ok(rows) => rows,
        Err(e) => {
            log::warn!("Could not list containers for the schedule summary: {e}");
            return;
        }
    };

    let labels = &settings.labels;
    let action_labels = [
        (labels.update.as_str(), "update"),
        (labels.restart.as_str(), "restart"),
        (labels.recreate.as_str(), "recreate"),
        (labels.health_check.as_str(), "health_check"),
    ];
    let mut upcoming = Vec::new();
    for row in &rows {
        if is_guerite_artifact(&row.name) {
            continue;
        }
        for (label, short) in action_labels {
            let Some(expr) = row.labels.get(label) else {
                continue;
            };
            let Ok(schedule) = crate::cron::parse_five_field(expr) else {
                continue;
            };
            if let Some(next) = evaluator.next_fire(&schedule, now) {
                upcoming.push((next, format!("{} ({short})", row.name)));
            }
        }
    }
    if let Some(prune_cron) = &settings.prune_cron {
        if let Some(next) = evaluator.next_fire(prune_cron, now) {
            upcoming.push((next, "images (prune)".to_string()));
        }
    }

    if upcoming.is_empty() {
        log::info!("No upcoming checks found");
        return;
    }
    upcoming.sort();
    let lines: Vec<String> = upcoming
        .iter()
        .take(10)
        .map(|(at, what)| {
            format!(
                "{} {what}",
                at.with_timezone(&settings.timezone).format("%Y-%m-%d %H:%M")
            )
        })
        .collect();
    log::info!("Upcoming checks: {}", lines.join("; "));
    notifier
        .emit(
            EventCategory::Startup,
            "guerite started".to_string(),
            format!("Checks scheduled for:\n{}", lines.join("\n")),
        )
        .await;
}

/// Wake the loop when the engine reports activity on a monitored
/// container. Cooldowns in the action engine keep our own swap churn from
/// re-triggering work.
fn start_event_listener(
    docker: bollard::Docker,
    settings: Arc<Settings>,
    trigger_tx: tokio::sync::mpsc::Sender<Trigger>,
) {
    const ACTIONS: [&str; 11] = [
        "create", "destroy", "die", "kill", "pause", "rename", "restart", "start", "stop",
        "unpause", "update",
    ];
    tokio::spawn(async move {
        loop {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            let mut stream = docker.events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(message) => {
                        let action = message.action.as_deref().unwrap_or("");
                        if !ACTIONS.contains(&action) {
                            continue;
                        }
                        let Some(attributes) =
                            message.actor.as_ref().and_then(|a| a.attributes.as_ref())
                        else {
                            continue;
                        };
                        let labeled = settings
                            .labels
                            .action_labels()
                            .iter()
                            .any(|label| attributes.contains_key(*label));
                        if !labeled {
                            continue;
                        }
                        let name = attributes.get("name").cloned().unwrap_or_default();
                        if is_guerite_artifact(&name) {
                            continue;
                        }
                        log::debug!("Docker event {action} for {name}; waking up");
                        let _ = trigger_tx.try_send(Trigger::Event);
                    }
                    Err(e) => {
                        log::warn!("Event stream error: {e}");
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}
