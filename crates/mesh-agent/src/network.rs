use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive failed checks before the host is reported offline.
pub const OFFLINE_AFTER_FAILURES: u32 = 2;

/// Whether a TCP connection to `addr` can be opened right now.
pub async fn probe(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Host online/offline signal.
///
/// Opens a TCP connection to `target` every `interval` and publishes only
/// transitions. `target` stands for the host's own network (a well-known
/// public endpoint), never the coordinator: a coordinator outage is an
/// unclean close handled by the reconnect backoff, not a host outage. One success flips back online;
/// going offline takes [`OFFLINE_AFTER_FAILURES`] failures in a row. Starts
/// optimistic (online).
pub fn spawn_connectivity_probe(
    target: String,
    interval: Duration,
    shutdown: CancellationToken,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(true);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                _ = ticker.tick() => {
                    if probe(&target).await {
                        failures = 0;
                    } else {
                        failures = failures.saturating_add(1);
                        tracing::debug!(%target, failures, "connectivity check failed");
                    }
                    let online = failures < OFFLINE_AFTER_FAILURES;
                    tx.send_if_modified(|current| {
                        if *current == online {
                            return false;
                        }
                        if online {
                            tracing::info!(%target, "host network back");
                        } else {
                            tracing::warn!(%target, "host network unreachable, going offline");
                        }
                        *current = online;
                        true
                    });
                }
            }
        }
    });
    rx
}
