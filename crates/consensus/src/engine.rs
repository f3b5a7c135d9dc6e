use tessera_primitives::Bytes;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::core::{Core, CoreEvent};
use crate::error::ConsensusError;
use crate::STOP_CHANNEL_CAPACITY;

/// Handle of a running consensus engine.
///
/// The engine is a single event loop that owns all consensus state and
/// consumes inbound messages, timer expiries and internal events one at a
/// time. It runs until stopped or until a backend fault halts it.
pub struct ConsensusEngine {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl ConsensusEngine {
    /// Spawns the engine event loop. `inbound` delivers RLP-encoded consensus
    /// messages from the gossip layer; the first height is derived from the
    /// backend's latest committed block.
    pub fn spawn<B: Backend>(backend: B, config: Config, inbound: mpsc::Receiver<Bytes>) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(STOP_CHANNEL_CAPACITY);
        let handle = tokio::spawn(run(backend, config, inbound, stop_rx));
        Self { stop_tx, handle }
    }

    /// Signals the event loop to shut down. Idempotent: any number of calls
    /// beyond the first are absorbed by the stop channel.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Waits for the event loop to exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn run<B: Backend>(
    backend: B,
    config: Config,
    mut inbound: mpsc::Receiver<Bytes>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let (mut core, mut events) = Core::new(backend, config);

    if let Err(err) = core.start_round(0) {
        error!(%err, "failed to initialize consensus");
        halt(&mut core, &mut stop_rx).await;
        return;
    }

    loop {
        let result = select! {
            biased;
            _ = stop_rx.recv() => {
                info!("stopping consensus engine");
                break;
            }
            Some(event) = events.recv() => match event {
                CoreEvent::Timeout(timeout) => core.handle_timeout(timeout),
                CoreEvent::Requeue(msg) => core.handle_msg(msg),
                CoreEvent::AdvanceHeight => core.start_round(0),
            },
            Some(payload) = inbound.recv() => core.handle_payload(&payload),
            else => {
                warn!("inbound channel closed, stopping consensus engine");
                break;
            }
        };

        match result {
            Ok(()) => {}
            Err(ConsensusError::Invalid(err)) => {
                warn!(%err, "rejected invalid consensus message");
            }
            Err(ConsensusError::Backend(err)) => {
                error!(%err, "backend fault, halting consensus");
                halt(&mut core, &mut stop_rx).await;
                return;
            }
            Err(err) => debug!(%err, "consensus message buffered or dropped"),
        }
    }

    core.cancel_timeouts();
}

/// A faulted engine stays alive but inert, waiting for operator intervention.
async fn halt<B: Backend>(core: &mut Core<B>, stop_rx: &mut mpsc::Receiver<()>) {
    core.cancel_timeouts();
    let _ = stop_rx.recv().await;
}
