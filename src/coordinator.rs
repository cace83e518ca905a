//! The receive coordinator: the hard part.
//!
//! Frames come back on one shared stream in whatever order the server
//! feels like sending them, but callers each want the one frame whose
//! response-to id matches the request they made. Rather than running a
//! dedicated background task to read frames and fan them out (the shape
//! `mux`'s `task()` loop uses), every caller here is willing to become the
//! reader for as long as nobody else is: the first one to ask gets told
//! `AssumeReceiverRole`, reads frames off the wire itself, hands any frame
//! that isn't its own to the next waiter, and relinquishes the role the
//! moment it's done, found or not.
//!
//! `FlowSlot`'s split between `Requested`/`Established` states is the model
//! for the two maps below: an id is either an `awaiter` (someone's waiting,
//! nothing's arrived) or `pending` (something arrived, nobody's claimed it
//! yet), never both at once.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;

/// What a caller should do after asking the coordinator for instructions.
pub(crate) enum Instruction {
    /// A frame for this caller's id was already waiting; here it is.
    ReturnBuffer(Bytes),
    /// Nobody's reading right now; this caller should read frames off the
    /// wire until it finds its own, relinquishing the role afterward.
    AssumeReceiverRole,
}

/// The coordinator's own, connection-id-agnostic error. `Connection` maps
/// this onto [`crate::error::ConnectionError`] once it knows its own id.
#[derive(Debug)]
pub(crate) enum CoordinatorError {
    Cancelled,
    Internal(&'static str),
}

struct State {
    awaiters: HashMap<i32, oneshot::Sender<Instruction>>,
    pending: HashMap<i32, Bytes>,
    receiver_assigned: bool,
}

pub(crate) struct ReceiveCoordinator {
    state: Mutex<State>,
}

impl ReceiveCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                awaiters: HashMap::new(),
                pending: HashMap::new(),
                receiver_assigned: false,
            }),
        }
    }

    /// Asks how a caller waiting on `response_to` should proceed: take an
    /// already-arrived buffer, become the reader, or wait for either.
    pub(crate) async fn get_instructions(
        &self,
        response_to: i32,
        cancel: &CancelToken,
    ) -> Result<Instruction, CoordinatorError> {
        let mut rx = {
            let mut state = self.state.lock();
            if let Some(buffer) = state.pending.remove(&response_to) {
                trace!(response_to, "pending buffer already here; returning it");
                return Ok(Instruction::ReturnBuffer(buffer));
            }
            if !state.receiver_assigned {
                state.receiver_assigned = true;
                debug!(response_to, "no reader assigned; assuming the receiver role");
                return Ok(Instruction::AssumeReceiverRole);
            }
            let (tx, rx) = oneshot::channel();
            state.awaiters.insert(response_to, tx);
            rx
        };

        tokio::select! {
            biased;
            result = &mut rx => match result {
                Ok(instruction) if cancel.is_cancelled() => {
                    // We were handed something (a buffer or the reader role)
                    // in the same breath we decided to cancel. The buffer
                    // case disposes by simply dropping it below; the role
                    // case must not be left stranded, so pass it on.
                    if let Instruction::AssumeReceiverRole = instruction {
                        self.relinquish();
                    }
                    Err(CoordinatorError::Cancelled)
                }
                Ok(instruction) => Ok(instruction),
                Err(_) => Err(CoordinatorError::Internal(
                    "receive coordinator dropped an awaiter without delivering an instruction",
                )),
            },
            () = cancel.cancelled() => {
                // Drop `rx` on the way out (implicit at scope exit). Any
                // `dispatch`/`relinquish` that later targets our id sees the
                // channel closed and handles it there: `dispatch` disposes
                // the buffer, `relinquish` offers the role to someone else.
                Err(CoordinatorError::Cancelled)
            }
        }
    }

    /// Delivers `buffer` to whoever is waiting on `response_to`, or holds it
    /// until someone asks.
    pub(crate) fn dispatch(&self, response_to: i32, buffer: Bytes) {
        let sender = self.state.lock().awaiters.remove(&response_to);
        match sender {
            Some(tx) => {
                if tx.send(Instruction::ReturnBuffer(buffer)).is_err() {
                    warn!(response_to, "waiter cancelled before delivery; dropping buffer");
                } else {
                    trace!(response_to, "dispatched frame to its waiter");
                }
            }
            None => {
                trace!(response_to, "no waiter yet; buffering frame until one asks");
                self.state.lock().pending.insert(response_to, buffer);
            }
        }
    }

    /// Gives up the reader role, handing it to a waiting awaiter if there is
    /// one, or marking the role free otherwise.
    pub(crate) fn relinquish(&self) {
        let mut state = self.state.lock();
        let Some(&next_id) = state.awaiters.keys().next() else {
            state.receiver_assigned = false;
            debug!("reader role released; no awaiters left");
            return;
        };
        // `HashMap` iteration order is arbitrary; there is no fairness
        // guarantee about which waiter inherits the role next, only that
        // someone does.
        let tx = state
            .awaiters
            .remove(&next_id)
            .expect("next_id was just observed in the map");
        drop(state);
        if tx.send(Instruction::AssumeReceiverRole).is_err() {
            // That waiter cancelled between us picking it and sending; try
            // the next one instead of stranding the role.
            self.relinquish();
        } else {
            debug!(next_id, "handed reader role to next awaiter");
        }
    }
}
