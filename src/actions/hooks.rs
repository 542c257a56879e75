//! Lifecycle hook execution. Hooks run inside the target container via the
//! engine's exec facility; a non-zero exit or timeout is logged and the
//! surrounding action continues.

use crate::engine::EngineClient;
use crate::inventory::Hook;

pub(super) async fn run<E: EngineClient>(
    engine: &E,
    container_name: &str,
    hook: Option<&Hook>,
    stage: &str,
) {
    let Some(hook) = hook else {
        return;
    };
    log::info!("Running {stage} hook in {container_name}: {}", hook.command);
    match engine
        .exec_in_container(container_name, &hook.command, hook.timeout)
        .await
    {
        Ok(0) => log::debug!("{stage} hook in {container_name} succeeded"),
        Ok(code) => {
            log::warn!("{stage} hook in {container_name} exited with {code}; continuing")
        }
        Err(e) => log::warn!("{stage} hook in {container_name} failed: {e}; continuing"),
    }
}
