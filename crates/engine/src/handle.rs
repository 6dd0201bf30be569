use crate::commands::{EngineCommand, EngineStatus};
use crate::events::CycleResult;
use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Cloneable control surface of a running engine actor.
///
/// The actor exits once every handle is dropped or `shutdown` is sent.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    status_rx: watch::Receiver<EngineStatus>,
    results: broadcast::Sender<CycleResult>,
}

impl EngineHandle {
    #[must_use]
    pub(crate) const fn new(
        tx: mpsc::Sender<EngineCommand>,
        status_rx: watch::Receiver<EngineStatus>,
        results: broadcast::Sender<CycleResult>,
    ) -> Self {
        Self {
            tx,
            status_rx,
            results,
        }
    }

    /// Starts scheduled cycles; the first runs immediately.
    ///
    /// # Errors
    /// Returns an error if the engine actor has exited.
    pub async fn start(&self) -> Result<()> {
        self.send(EngineCommand::Start).await
    }

    /// # Errors
    /// Returns an error if the engine actor has exited.
    pub async fn pause(&self) -> Result<()> {
        self.send(EngineCommand::Pause).await
    }

    /// # Errors
    /// Returns an error if the engine actor has exited.
    pub async fn resume(&self) -> Result<()> {
        self.send(EngineCommand::Resume).await
    }

    /// Stops after the current cycle. Open positions are left to the broker.
    ///
    /// # Errors
    /// Returns an error if the engine actor has exited.
    pub async fn stop(&self) -> Result<()> {
        self.send(EngineCommand::Stop).await
    }

    /// Trips the emergency stop and waits for the containment cycle.
    ///
    /// # Errors
    /// Returns an error if the engine actor has exited or refused the command.
    pub async fn emergency_stop(&self) -> Result<CycleResult> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::EmergencyStop(tx)).await?;
        rx.await.context("Engine did not run the containment cycle")
    }

    /// Runs one cycle out of schedule and returns its result.
    ///
    /// # Errors
    /// Returns an error if the engine actor has exited or is stopped.
    pub async fn run_cycle(&self) -> Result<CycleResult> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::RunCycle(tx)).await?;
        rx.await.context("Engine refused to run a cycle")
    }

    /// Asks the actor for a fresh status.
    ///
    /// # Errors
    /// Returns an error if the command cannot be sent or the response cannot be received.
    pub async fn status(&self) -> Result<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::GetStatus(tx)).await?;
        Ok(rx.await?)
    }

    /// Last published status without a round trip to the actor.
    #[must_use]
    pub fn latest_status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }

    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }

    /// Receives every cycle result published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CycleResult> {
        self.results.subscribe()
    }

    /// # Errors
    /// Returns an error if the engine actor has already exited.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(EngineCommand::Shutdown).await
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .context("Engine actor is no longer running")
    }
}
