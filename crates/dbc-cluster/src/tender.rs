//! Background tend task

use crate::error::Result;
use crate::tend::{ClusterCore, TendState};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle on the running tender
#[derive(Debug)]
pub(crate) struct Tender {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Tender {
    /// Start tending every `interval` until shutdown
    pub(crate) fn spawn(core: Arc<ClusterCore>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!("Cluster tender started, interval {:?}", interval);

            while core.is_valid() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let mut state = core.state.lock().await;
                match core.tend(&mut state, false).await {
                    Ok(report) => {
                        if !report.added.is_empty() || !report.removed.is_empty() {
                            info!(
                                "Tend cycle: {} nodes, added {:?}, removed {:?}",
                                report.node_count, report.added, report.removed
                            );
                        }
                    }
                    Err(e) => warn!("Tend cycle failed: {}", e),
                }
            }

            info!("Cluster tender stopped");
        });

        Self { cancel, handle }
    }

    /// Signal the tender and wait for it to exit
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Cluster tender terminated abnormally: {}", e);
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Tend until the node count stops changing or the connection timeout elapses
pub(crate) async fn wait_till_stabilized(core: &ClusterCore, state: &mut TendState) -> Result<()> {
    let deadline = Instant::now() + core.context.conn_timeout();
    let mut last_count = None;

    loop {
        let report = core.tend(state, true).await?;

        if last_count == Some(report.node_count) {
            debug!("Cluster stabilized with {} nodes", report.node_count);
            return Ok(());
        }
        last_count = Some(report.node_count);

        if Instant::now() >= deadline {
            debug!("Cluster not stable after {:?}", core.context.conn_timeout());
            return Ok(());
        }
        tokio::task::yield_now().await;
    }
}
