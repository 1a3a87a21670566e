use anyhow::Result;
use spanlens_core::config::Config;
use spanlens_state::locks::{FileLockService, LockService, ReleaseOutcome};
use std::path::Path;
use std::time::Duration;

pub fn run(repo_root: &Path, config: &Config, resource: &str, release: Option<&str>) -> Result<()> {
    let service = FileLockService::new(
        config.lock_dir(repo_root),
        Duration::from_millis(config.locks.backoff_ms),
    );

    if let Some(task_id) = release {
        match service.release(resource, task_id)? {
            ReleaseOutcome::Released => println!("Released {resource}"),
            ReleaseOutcome::NotOwner { holder: Some(holder) } => {
                anyhow::bail!("{task_id} does not own {resource} (held by {holder})")
            }
            ReleaseOutcome::NotOwner { holder: None } => println!("{resource} is not locked"),
        }
        return Ok(());
    }

    match service.current(resource)? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("{resource} is not locked"),
    }
    Ok(())
}
