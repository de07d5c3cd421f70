//! Self-restart supervision.
//!
//! A member removed from the cluster wipes its replicated state and its
//! trust store, then replaces its own process image with a fresh
//! invocation of the same binary. Two things must happen before the replacement:
//!
//! - the response to the reset request has been delivered, and
//! - no self-removal request on this node is still answering its caller.
//!
//! The first is signalled through a [`ResetTicket`] carried by the
//! response body; the second through the [`RestartGate`], a single slot
//! held by a [`SelfRemovalHold`] for as long as a self-removal response
//! is in flight.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};
use tracing::{debug, error, info, warn};

use corral_state::TrustStore;

use crate::consensus::Consensus;
use crate::error::{ClusterError, ClusterResult};

/// How a tracked response body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every byte was handed to the transport.
    Flushed,
    /// The body was dropped before it finished.
    Aborted,
}

/// Single-slot coordination between self-removal and process restart.
#[derive(Debug, Clone, Default)]
pub struct RestartGate {
    slot: Arc<Mutex<()>>,
}

impl RestartGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupy the slot while a self-removal request is answered.
    pub async fn hold_self_removal(&self, member: &str) -> SelfRemovalHold {
        let guard = self.slot.clone().lock_owned().await;
        info!(%member, "acquired cluster self removal lock");
        SelfRemovalHold {
            member: member.to_string(),
            _guard: guard,
        }
    }

    /// True while a self-removal response or a restart occupies the slot.
    pub fn is_held(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    async fn wait_for_restart_slot(&self) -> OwnedMutexGuard<()> {
        self.slot.clone().lock_owned().await
    }
}

/// Occupies the [`RestartGate`] until dropped.
#[derive(Debug)]
pub struct SelfRemovalHold {
    member: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SelfRemovalHold {
    fn drop(&mut self) {
        info!(member = %self.member, "releasing cluster self removal lock");
    }
}

/// Signal that the reset response has finished (or failed) delivery.
///
/// Dropping a ticket without delivering it counts as [`Delivery::Aborted`].
#[derive(Debug)]
pub struct ResetTicket {
    delivered: oneshot::Sender<Delivery>,
}

impl ResetTicket {
    pub fn deliver(self, delivery: Delivery) {
        // The continuation only disappears if the runtime is shutting down.
        let _ = self.delivered.send(delivery);
    }
}

/// Replaces the running process image.
pub trait ProcessReplacer: Send + Sync {
    /// Does not return on success in real implementations.
    fn replace_process(&self) -> ClusterResult<()>;
}

/// Re-executes `/proc/self/exe` with the given arguments and the current
/// environment.
#[derive(Debug, Clone)]
pub struct ExecReplacer {
    args: Vec<OsString>,
}

impl ExecReplacer {
    /// `args` excludes the program name.
    pub fn new(args: Vec<OsString>) -> Self {
        Self { args }
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

/// Strip the marker the kernel appends when the binary was replaced on disk.
pub fn current_exe_path(link: &Path) -> PathBuf {
    let raw = link.to_string_lossy();
    PathBuf::from(raw.strip_suffix(" (deleted)").unwrap_or(&raw))
}

impl ProcessReplacer for ExecReplacer {
    #[cfg(unix)]
    fn replace_process(&self) -> ClusterResult<()> {
        use std::os::unix::process::CommandExt;

        let link = std::fs::read_link("/proc/self/exe")
            .map_err(|e| ClusterError::Internal(format!("failed to resolve executable: {e}")))?;
        let exe = current_exe_path(&link);
        let err = std::process::Command::new(&exe)
            .args(&self.args)
            .exec();
        Err(ClusterError::Internal(format!(
            "failed to exec {}: {err}",
            exe.display()
        )))
    }

    #[cfg(not(unix))]
    fn replace_process(&self) -> ClusterResult<()> {
        Err(ClusterError::Internal(
            "process replacement is only supported on unix".into(),
        ))
    }
}

/// Tears down local state and restarts the daemon once it is safe to.
#[derive(Clone)]
pub struct Supervisor {
    gate: RestartGate,
    consensus: Arc<dyn Consensus>,
    trust: Arc<TrustStore>,
    state_dir: PathBuf,
    replacer: Arc<dyn ProcessReplacer>,
}

impl Supervisor {
    pub fn new(
        gate: RestartGate,
        consensus: Arc<dyn Consensus>,
        trust: Arc<TrustStore>,
        state_dir: PathBuf,
        replacer: Arc<dyn ProcessReplacer>,
    ) -> Self {
        Self {
            gate,
            consensus,
            trust,
            state_dir,
            replacer,
        }
    }

    pub fn gate(&self) -> &RestartGate {
        &self.gate
    }

    /// Stop consensus, forget every trusted remote, delete local state, and
    /// schedule the restart.
    ///
    /// The restart waits for the returned ticket to be delivered, then
    /// for the restart gate to be free, then calls [`Self::execute_reset`].
    pub async fn arm_reset(&self) -> ClusterResult<ResetTicket> {
        self.consensus
            .stop()
            .await
            .map_err(|e| ClusterError::Internal(format!("failed shutting down consensus: {e}")))?;

        self.trust
            .replace(Vec::new())
            .map_err(|e| ClusterError::Internal(format!("failed to clear the trust store: {e}")))?;

        match tokio::fs::remove_dir_all(&self.state_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ClusterError::Internal(format!(
                    "failed to remove the state directory {}: {e}",
                    self.state_dir.display()
                )));
            }
        }
        info!(state_dir = %self.state_dir.display(), "local cluster state removed");

        let (tx, rx) = oneshot::channel();
        let supervisor = self.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(Delivery::Flushed) => debug!("reset response flushed"),
                Ok(Delivery::Aborted) | Err(_) => {
                    error!("reset response was not fully delivered before restart")
                }
            }
            if let Err(e) = supervisor.execute_reset().await {
                warn!(error = %e, "daemon remains running without cluster state");
            }
        });

        Ok(ResetTicket { delivered: tx })
    }

    /// Wait for the restart gate, then replace the process.
    pub async fn execute_reset(&self) -> ClusterResult<()> {
        let _slot = self.gate.wait_for_restart_slot().await;
        info!("restarting daemon following removal from cluster");
        self.replacer.replace_process().inspect_err(|e| {
            error!(error = %e, "failed restarting daemon");
        })
    }
}
