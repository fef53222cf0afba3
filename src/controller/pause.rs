use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control_surface::ControlSurface;

/// Read side of the operator run/pause flag. `true` means running. Only the
/// Pause Coordinator writes it; the engine reads it at resolver-attempt
/// boundaries, never mid-dispatch.
#[derive(Clone)]
pub struct OperatorSignal {
    rx: watch::Receiver<bool>,
}

impl OperatorSignal {
    pub fn is_running(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until the signal is set. This is the engine's only safe
    /// suspension point for pause; if the writer is gone the agent keeps
    /// running rather than deadlocking.
    pub async fn wait_until_running(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            info!("Operator paused; waiting at step boundary");
            if self.rx.changed().await.is_err() {
                warn!("Pause coordinator dropped; resuming");
                return;
            }
        }
    }
}

/// Write side, held only by the Pause Coordinator.
pub struct OperatorSignalHandle {
    tx: watch::Sender<bool>,
}

impl OperatorSignalHandle {
    pub fn set_running(&self, running: bool) {
        // Idempotent single-bit flip; send_replace avoids waking readers
        // needlessly when the value is unchanged.
        if *self.tx.borrow() != running {
            let _ = self.tx.send(running);
        }
    }
}

pub fn operator_signal() -> (OperatorSignalHandle, OperatorSignal) {
    let (tx, rx) = watch::channel(true);
    (OperatorSignalHandle { tx }, OperatorSignal { rx })
}

/// Background task mirroring the control surface's reported pause flag onto
/// the local cooperative signal on a fixed interval.
pub struct PauseCoordinator {
    surface: Arc<dyn ControlSurface>,
    handle: OperatorSignalHandle,
    poll_interval: Duration,
}

impl PauseCoordinator {
    pub fn new(
        surface: Arc<dyn ControlSurface>,
        handle: OperatorSignalHandle,
        poll_interval: Duration,
    ) -> Self {
        Self { surface, handle, poll_interval }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.surface.read_state().await {
                    Ok(state) => self.handle.set_running(!state.is_paused),
                    // An unreachable surface leaves the last known state in
                    // place; flapping to running on read errors would defeat
                    // an operator's pause.
                    Err(e) => debug!("Pause poll failed: {}", e),
                }
            }
        })
    }
}
