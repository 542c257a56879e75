use std::process::ExitCode;
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::Trigger;

pub fn send_signal(signal: crate::cli::Signal) -> ExitCode {
    let pid_file = &crate::cli::get_cli_args().pid_file;

    let pid = match std::fs::read_to_string(pid_file) {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("Unable to read pid file: {err}");
            return ExitCode::FAILURE;
        }
    };

    let pid: i32 = match pid.trim().parse() {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("Unable to parse pid: {err}");
            return ExitCode::FAILURE;
        }
    };

    let signal: nix::sys::signal::Signal = signal.into();
    if let Err(err) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        eprintln!("Unable to send signal: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// First stop signal lets the in-flight cycle commit or roll back; a
/// second one exits immediately.
pub fn handle_shutdown(shutdown: Arc<tokio::sync::Notify>) {
    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("signal registration");

    std::thread::spawn(move || {
        let mut already_stopping = false;
        for _ in signals.forever() {
            if already_stopping {
                log::warn!("Second stop signal; exiting immediately");
                let _ = std::fs::remove_file(&crate::cli::get_cli_args().pid_file);
                std::process::exit(1);
            }
            already_stopping = true;
            log::info!("Stop signal received; finishing the current cycle");
            shutdown.notify_one();
        }
    });
}

/// SIGHUP queues an immediate cycle, same path as the HTTP trigger.
pub fn handle_trigger(trigger_tx: tokio::sync::mpsc::Sender<Trigger>) {
    let mut signals = Signals::new([SIGHUP]).expect("signal registration");

    std::thread::spawn(move || {
        for _ in signals.forever() {
            log::info!("Trigger signal received");
            let _ = trigger_tx.try_send(Trigger::Signal);
        }
    });
}

pub fn write_pid_file() -> std::io::Result<()> {
    std::fs::write(
        &crate::cli::get_cli_args().pid_file,
        std::process::id().to_string(),
    )
}

pub fn remove_pid_file() {
    let _ = std::fs::remove_file(&crate::cli::get_cli_args().pid_file);
}
