// Copyright 2020 Joyent, Inc.

//! Matches answers arriving on the channel to the calls awaiting them.
//!
//! Each call owns a one-shot answer slot registered before its request is
//! written, so an answer can never race ahead of its waiter. A slot is
//! consumed exactly once: by the answer, by the waiter giving up, or by the
//! connection failing, which fails every call still waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde_json::Value;
use slog::{debug, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::messages::{Answer, Request, CANCEL_NOTICE};
use crate::protocol::{Message, RequestId, RequestIdGenerator};

struct Slot {
    tx: oneshot::Sender<Answer>,
    created: Instant,
}

#[derive(Default)]
struct State {
    slots: HashMap<RequestId, Slot>,
    lost: Option<String>,
}

pub struct Correlator {
    ids: RequestIdGenerator,
    state: Mutex<State>,
    outbound: mpsc::UnboundedSender<Message>,
    log: Logger,
}

/// A sent request whose answer has not been consumed yet.
pub struct Ticket {
    id: RequestId,
    rx: oneshot::Receiver<Answer>,
    owner: Arc<Correlator>,
}

impl Ticket {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.owner.state().slots.remove(&self.id);
    }
}

impl Correlator {
    pub fn new(outbound: mpsc::UnboundedSender<Message>, log: Logger) -> Correlator {
        Correlator {
            ids: RequestIdGenerator::new(),
            state: Mutex::new(State::default()),
            outbound,
            log,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `request` on the channel and return without waiting.
    pub fn send(self: &Arc<Self>, request: &Request) -> Result<Ticket> {
        let body = serde_json::to_value(request)?;
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state();
            if let Some(reason) = &state.lost {
                return Err(Error::ConnectionLost(reason.clone()));
            }
            state.slots.insert(
                id,
                Slot {
                    tx,
                    created: Instant::now(),
                },
            );
        }
        let ticket = Ticket {
            id,
            rx,
            owner: Arc::clone(self),
        };

        self.outbound
            .send(Message::request(id, request.name(), body))
            .map_err(|_| Error::ConnectionLost(String::from("channel writer has stopped")))?;
        debug!(self.log, "request sent"; "request_id" => id, "op" => request.name());
        Ok(ticket)
    }

    /// Wait for the answer to `ticket`.
    ///
    /// If `cancel` fires first, a cancellation notice for the request is
    /// sent and `Error::Canceled` returned. If the connection fails first,
    /// its error is returned.
    pub async fn await_answer(&self, mut ticket: Ticket, cancel: &CancellationToken) -> Result<Answer> {
        tokio::select! {
            biased;
            answer = &mut ticket.rx => match answer {
                Ok(answer) => Ok(answer),
                Err(_) => Err(Error::ConnectionLost(self.lost_reason())),
            },
            _ = cancel.cancelled() => {
                // The caller gave up either way; a lost notice only means the
                // server finds out when the connection closes.
                if let Err(e) = self.cancel(ticket.id) {
                    warn!(self.log, "failed to send cancel notice";
                        "request_id" => ticket.id, "err" => %e);
                }
                Err(Error::Canceled)
            }
        }
    }

    /// Send a cancellation notice for `id`. Harmless for ids that already
    /// completed or were never issued.
    pub fn cancel(&self, id: RequestId) -> Result<()> {
        debug!(self.log, "cancelling request"; "request_id" => id);
        self.outbound
            .send(Message::notice(id, CANCEL_NOTICE, Value::Null))
            .map_err(|_| Error::ConnectionLost(self.lost_reason()))
    }

    /// Hand an answer to its waiter. Returns false when nobody is waiting
    /// for `id` any more.
    pub fn deliver(&self, id: RequestId, answer: Answer) -> bool {
        let slot = self.state().slots.remove(&id);
        match slot {
            Some(slot) => {
                let waited = slot.created.elapsed();
                if slot.tx.send(answer).is_err() {
                    debug!(self.log, "waiter gone before answer"; "request_id" => id);
                    return false;
                }
                debug!(self.log, "answer delivered";
                    "request_id" => id, "waited_ms" => waited.as_millis() as u64);
                true
            }
            None => {
                debug!(self.log, "discarding answer without waiter"; "request_id" => id);
                false
            }
        }
    }

    /// Fail every outstanding call and refuse new ones.
    pub fn connection_lost(&self, reason: &str) {
        let orphaned = {
            let mut state = self.state();
            if state.lost.is_none() {
                state.lost = Some(String::from(reason));
            }
            std::mem::take(&mut state.slots)
        };
        if !orphaned.is_empty() {
            warn!(self.log, "connection lost with calls outstanding";
                "outstanding" => orphaned.len(), "err" => reason);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().lost.is_none()
    }

    pub fn outstanding(&self) -> usize {
        self.state().slots.len()
    }

    fn lost_reason(&self) -> String {
        self.state()
            .lost
            .clone()
            .unwrap_or_else(|| String::from("answer channel closed"))
    }
}
