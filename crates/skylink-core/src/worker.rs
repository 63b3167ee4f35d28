use std::io;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{bounded, Sender, TrySendError};
use skylink_fc::VehicleLink;
use tracing::{debug, info, warn};

use crate::translator::{CommandTranslator, Execution};

/// Producer side of the command queue. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct CommandQueue {
    tx: Sender<Bytes>,
}

impl CommandQueue {
    /// Hands a raw command payload to the worker. Returns false when it was
    /// dropped because the queue is full or the worker is gone.
    pub fn submit(&self, payload: Bytes) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("command queue full, dropping command");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("command worker stopped, dropping command");
                false
            }
        }
    }
}

/// Runs the translator on its own thread, one command at a time, so composite
/// command delays never hold up bus dispatch. The worker exits once every
/// [`CommandQueue`] clone is dropped.
pub fn spawn_worker<L, F>(
    translator: CommandTranslator<L>,
    depth: usize,
    mut on_executed: F,
) -> io::Result<(CommandQueue, JoinHandle<()>)>
where
    L: VehicleLink,
    F: FnMut(&Execution) + Send + 'static,
{
    let (tx, rx) = bounded::<Bytes>(depth.max(1));
    let handle = thread::Builder::new().name("cmd-worker".into()).spawn(move || {
        for payload in rx.iter() {
            // failures are logged by the translator with kind and message id
            match translator.handle_payload(&payload) {
                Ok(exec) => on_executed(&exec),
                Err(e) => debug!(bytes = payload.len(), "command not executed: {e}"),
            }
        }
        info!("command worker stopped");
    })?;
    Ok((CommandQueue { tx }, handle))
}
