//! One-shot completion gate for the worker's terminal event.
//!
//! A run can finish in two ways that may both fire: the snippet calls its
//! callback, or the value it returned settles. Both go through the same
//! gate and only the first settlement is kept.

use crate::fault::Fault;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// Terminal outcome of a run.
pub type Settled = Result<Value, Fault>;

/// Producer side, shared by every path that may settle the run.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<Mutex<Option<oneshot::Sender<Settled>>>>,
}

/// Consumer side, awaited by the runtime.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Settled>,
}

impl Gate {
    pub fn new() -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            Completion { rx },
        )
    }

    /// Settle the run. Returns false, and drops `outcome`, if it was already settled.
    pub fn settle(&self, outcome: Settled) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match tx {
            Some(tx) => {
                // The receiver is only gone once the runtime stopped waiting.
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!(ok = outcome.is_ok(), "ignoring settlement, run already settled");
                false
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

impl Completion {
    /// Wait for the first settlement.
    ///
    /// Returns `None` if every [`Gate`] handle was dropped unsettled.
    pub async fn wait(self) -> Option<Settled> {
        self.rx.await.ok()
    }
}
