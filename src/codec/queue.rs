//! FIFO command/response reconciliation
//!
//! Commands are queued in send order together with their sequence number.
//! When a response arrives the queue is scanned from the head: commands older
//! than the response by more than the tolerated gap are rejected as missing,
//! the command with the same sequence number is settled, and scanning stops at
//! the first command that is newer than the response.
//!
//! Sequence numbers are 8 bit and wrap, so the distance between a queued
//! command and a response is folded into `[-127, 127]` before comparison.

use crate::error::{LinkError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Receiver half handed out by [`CommandResponseQueue::add_command`]
pub type ResponseReceiver = oneshot::Receiver<Result<Vec<u8>>>;

const SEQUENCE_MODULUS: i32 = 255;
const WINDOW: i32 = 127;
const TOLERATED_GAP: i32 = -2;

struct PendingCommand {
    sequence: u8,
    command: u32,
    responder: oneshot::Sender<Result<Vec<u8>>>,
}

/// Pending commands of one message based codec
pub struct CommandResponseQueue {
    name: String,
    items: Mutex<VecDeque<PendingCommand>>,
}

impl CommandResponseQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a command and get the receiver its response will be delivered on
    pub fn add_command(&self, command: u32, sequence: u8) -> ResponseReceiver {
        let (tx, rx) = oneshot::channel();
        match self.items.lock() {
            Ok(mut items) => items.push_back(PendingCommand {
                sequence,
                command,
                responder: tx,
            }),
            Err(_) => {
                tracing::error!(
                    queue = %self.name,
                    command,
                    sequence,
                    "command queue poisoned, command dropped"
                );
                let _ = tx.send(Err(LinkError::Protocol(format!(
                    "{} command queue poisoned",
                    self.name
                ))));
            }
        }
        rx
    }

    /// Settle the command matching a successful response
    pub fn add_response(&self, response: Vec<u8>, command: u32, sequence: Option<u8>) {
        self.reconcile(Ok(response), command, sequence);
    }

    /// Settle the command matching an error response
    pub fn add_error_response(&self, message: impl Into<String>, command: u32, sequence: Option<u8>) {
        self.reconcile(Err(LinkError::Device(message.into())), command, sequence);
    }

    fn reconcile(&self, outcome: Result<Vec<u8>>, command: u32, sequence: Option<u8>) {
        let mut settled: Vec<(oneshot::Sender<Result<Vec<u8>>>, Result<Vec<u8>>)> = Vec::new();
        {
            let Ok(mut items) = self.items.lock() else {
                return;
            };

            let tail_sequence = items.back().map(|item| item.sequence);
            let mut limit = if sequence.is_some() && tail_sequence == sequence {
                0
            } else {
                TOLERATED_GAP
            };
            let mut outcome = Some(outcome);
            let mut index = 0;

            while index < items.len() {
                let step = match sequence {
                    None => 0,
                    Some(seq) => normalize_step(i32::from(items[index].sequence) - i32::from(seq)),
                };

                if step < limit {
                    if let Some(item) = items.remove(index) {
                        let err = LinkError::MissingResponse {
                            name: self.name.clone(),
                            sequence: item.sequence,
                        };
                        settled.push((item.responder, Err(err)));
                    }
                    limit = TOLERATED_GAP;
                } else if step == 0 {
                    if let Some(item) = items.remove(index) {
                        let result = if item.command != command {
                            Err(LinkError::CommandMismatch {
                                name: self.name.clone(),
                                expected: item.command,
                                received: command,
                            })
                        } else {
                            outcome
                                .take()
                                .unwrap_or_else(|| Err(LinkError::Protocol("response already consumed".into())))
                        };
                        settled.push((item.responder, result));
                    }
                    break;
                } else if step > 0 {
                    break;
                } else {
                    index += 1;
                }
            }
        }

        if settled.is_empty() {
            tracing::trace!(queue = %self.name, ?sequence, command, "dropping unmatched response");
        }
        for (responder, result) in settled {
            // A dropped receiver means nobody is waiting any more.
            let _ = responder.send(result);
        }
    }

    /// Reject every pending command
    pub fn clear_all(&self) {
        let drained: Vec<PendingCommand> = match self.items.lock() {
            Ok(mut items) => items.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for item in drained {
            let _ = item.responder.send(Err(LinkError::QueueReset(self.name.clone())));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().map(|items| items.is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }
}

/// Fold a raw sequence distance into `[-127, 127]`
pub fn normalize_step(step: i32) -> i32 {
    if step > WINDOW {
        step - SEQUENCE_MODULUS
    } else if step < -WINDOW {
        step + SEQUENCE_MODULUS
    } else {
        step
    }
}

/// Await a queued response, treating a dropped sender as a reset
pub async fn wait_for_response(name: &str, rx: ResponseReceiver) -> Result<Vec<u8>> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(LinkError::QueueReset(name.to_string())),
    }
}
