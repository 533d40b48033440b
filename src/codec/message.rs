//! Bookkeeping shared by command/response packet codecs
//!
//! [`MessageCodecCore`] owns the [`CommandResponseQueue`] of a codec and the
//! outbound packets held back while the controller has too many commands
//! outstanding. The codec supplies the pause predicate and the function that
//! actually hands a packet to the parent encoder.
//!
//! It also holds the [`FirmwareCheck`]s run once a controller has reported
//! its firmware version on connect.

use super::queue::CommandResponseQueue;
use crate::error::{LinkError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Controller details handed to firmware checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Version as reported by the controller, `a.b.c.d` or `UNKNOWN`
    pub detected_version: String,
    pub model_id: String,
    pub controller: String,
}

/// Decides whether a controller's firmware is acceptable
///
/// A check may take as long as it needs, for example to ask the user or to
/// update the firmware. With `no_firmware_change` set it must not touch the
/// firmware.
#[async_trait]
pub trait FirmwareCheck: Send + Sync {
    async fn check(&self, info: &FirmwareInfo, no_firmware_change: bool) -> Result<()>;
}

pub struct MessageCodecCore {
    id: String,
    queue: CommandResponseQueue,
    pending: Mutex<Option<VecDeque<Vec<u8>>>>,
    firmware_checks: Mutex<Vec<(String, Arc<dyn FirmwareCheck>)>>,
}

impl MessageCodecCore {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            queue: CommandResponseQueue::new(id.clone()),
            id,
            pending: Mutex::new(None),
            firmware_checks: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &CommandResponseQueue {
        &self.queue
    }

    /// Whether outbound packets are currently held back
    pub fn is_paused(&self) -> bool {
        self.pending.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    /// Send a packet, or hold it back if transmission is paused
    pub fn transmit<P, S>(&self, packet: Vec<u8>, should_pause: P, send: S) -> Result<()>
    where
        P: Fn(&[u8]) -> bool,
        S: Fn(Vec<u8>) -> Result<()>,
    {
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| LinkError::Protocol(format!("{} transmit state poisoned", self.id)))?;
            if let Some(held) = pending.as_mut() {
                held.push_back(packet);
                return Ok(());
            }
            if should_pause(&packet) {
                tracing::info!(codec = %self.id, "pausing transmissions");
                *pending = Some(VecDeque::from([packet]));
                return Ok(());
            }
        }
        tracing::debug!(codec = %self.id, packet = ?packet, "send");
        send(packet)
    }

    /// Account for an inbound packet and release held packets that may go
    pub fn packet_received<P, S>(&self, packet: &[u8], should_pause: P, send: S) -> Result<()>
    where
        P: Fn(&[u8]) -> bool,
        S: Fn(Vec<u8>) -> Result<()>,
    {
        tracing::debug!(codec = %self.id, packet = ?packet, "receive");

        let mut released = Vec::new();
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(mut held) = pending.take() {
                while let Some(front) = held.front() {
                    if should_pause(front) {
                        break;
                    }
                    if let Some(next) = held.pop_front() {
                        released.push(next);
                    }
                }
                if held.is_empty() {
                    tracing::info!(codec = %self.id, "resuming transmissions");
                } else {
                    *pending = Some(held);
                }
            }
        }

        for packet in released {
            send(packet)?;
        }
        Ok(())
    }

    /// Fails while commands are still waiting for a response
    pub fn ping(&self) -> Result<()> {
        if self.queue.is_empty() {
            Ok(())
        } else {
            Err(LinkError::NoResponse(self.id.clone()))
        }
    }

    /// Add a firmware check, replacing any earlier one under `name`
    pub fn register_firmware_check(&self, name: impl Into<String>, check: Arc<dyn FirmwareCheck>) {
        let name = name.into();
        if let Ok(mut checks) = self.firmware_checks.lock() {
            match checks.iter_mut().find(|(existing, _)| *existing == name) {
                Some(entry) => entry.1 = check,
                None => checks.push((name, check)),
            }
        }
    }

    pub fn unregister_firmware_check(&self, name: &str) {
        if let Ok(mut checks) = self.firmware_checks.lock() {
            checks.retain(|(existing, _)| existing != name);
        }
    }

    /// Run every registered check; the first failure in registration order wins
    pub async fn check_firmware(&self, info: &FirmwareInfo, no_firmware_change: bool) -> Result<()> {
        let checks: Vec<Arc<dyn FirmwareCheck>> = self
            .firmware_checks
            .lock()
            .map_err(|_| LinkError::Protocol(format!("{} firmware checks poisoned", self.id)))?
            .iter()
            .map(|(_, check)| check.clone())
            .collect();
        if checks.is_empty() {
            return Ok(());
        }

        tracing::debug!(codec = %self.id, version = %info.detected_version, "checking firmware");
        join_all(checks.iter().map(|check| check.check(info, no_firmware_change)))
            .await
            .into_iter()
            .collect()
    }

    /// Drop pending commands and held packets
    pub fn reset(&self) {
        self.queue.clear_all();
        if let Ok(mut pending) = self.pending.lock() {
            *pending = None;
        }
    }
}
