//! Long-running jobs that restart after failure

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run `job` until `cancel` fires, starting it again `delay` after every
/// return. Returns how many times the job was restarted.
pub async fn run_restartable<F, Fut, E>(
    name: &str,
    chain_id: u64,
    delay: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> u64
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut restarts = 0u64;
    while !cancel.is_cancelled() {
        let result = job(cancel.clone()).await;
        if cancel.is_cancelled() {
            break;
        }
        match result {
            Ok(()) => info!(chain_id, "{} stopped, restarting in {:?}", name, delay),
            Err(e) => warn!(chain_id, error = %e, "{} failed, restarting in {:?}", name, delay),
        }
        restarts += 1;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    restarts
}
