//! USB2ANY packet codec
//!
//! Frames commands for a USB2ANY controller and reconciles its replies with
//! the commands that produced them.
//!
//! # Packet layout
//!
//! ```text
//! [0] 'T'  [1] CRC-8  [2] payload length  [3] type  [4] flags
//! [5] sequence  [6] status  [7] command  [8..] payload
//! ```
//!
//! The CRC (polynomial 0x07) covers bytes `2..`. A packet is at most 62 bytes,
//! leaving 54 for payload. Sequence numbers run from 1 to 254; 0 is reserved
//! for asynchronous packets sent by the controller.

use super::data_type::{self, binary_or_buffer};
use super::message::{FirmwareCheck, FirmwareInfo, MessageCodecCore};
use super::queue::wait_for_response;
use super::{Codec, CodecCore, NodeKind, Payload};
use crate::error::{LinkError, Result};
use crate::events::EventHub;
use crate::transport::ConnectionLog;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PACKET_IDENTIFIER: u8 = b'T';
pub const PACKET_PEC: usize = 1;
pub const PACKET_PAYLOAD_LEN: usize = 2;
pub const PACKET_TYPE: usize = 3;
pub const PACKET_FLAGS: usize = 4;
pub const PACKET_SEQ_NUM: usize = 5;
pub const PACKET_STATUS: usize = 6;
pub const PACKET_COMMAND: usize = 7;
pub const PACKET_PAYLOAD: usize = 8;

pub const MAX_PACKET_SIZE: usize = 62;
pub const PACKET_HEADER_SIZE: usize = PACKET_PAYLOAD;
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;

const COMMAND_PACKET: u8 = 1;
const REPLY_PACKET: u8 = 2;
const ERROR_PACKET: u8 = 3;
const PAYLOAD_PACKET: u8 = 4;
const INTERRUPT_PACKET: u8 = 5;

/// Controller commands used by the codec itself
pub mod command {
    pub const LOOP_PACKET: u8 = 0;
    pub const FIRMWARE_VERSION_READ: u8 = 10;
    pub const INVOKE_BSL: u8 = 97;
    pub const I2C_READ_INTERNAL: u8 = 101;
    pub const LED_SET_STATE: u8 = 104;
    pub const STATUS_GET_CONTROLLER_TYPE: u8 = 106;
}

/// Oldest firmware the codec talks to (2.6.2.20)
pub const MIN_FIRMWARE_REQUIRED: u32 = version_to_u32([2, 6, 2, 20]);

const fn version_to_u32(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

const CRC8_TABLE: [u8; 256] = build_crc8_table();

const fn build_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-8 (polynomial 0x07) over `bytes`
pub fn crc8(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |crc, &b| CRC8_TABLE[usize::from(b ^ crc)])
}

/// Controller error code to message
pub fn error_string(code: i32) -> Option<&'static str> {
    let text = match code {
        0 => "No error",
        -1 => "Receiver overflowed",
        -2 => "Receive buffer is empty",
        -3 => "Transmit buffer is full",
        -4 => "Transmit is stalled",
        -5 => "Transmit failed",
        -6 => "Failed to open communications port",
        -7 => "Communications port is not open",
        -8 => "Communications port is open",
        -9 => "Receive timeout",
        -10 => "Communications port read error",
        -11 => "Communications port write error",
        -12 => "Communications device not found",
        -13 => "Communications CRC failed",
        -20 => "Invalid port",
        -21 => "Address is out of accepted range",
        -22 => "Invalid function code",
        -23 => "Invalid packet size",
        -24 => "Invalid handle",
        -25 => "Operation failed",
        -26 => "Parameter is out of range",
        -27 => "Packet is out of sequence",
        -28 => "Invalid packet header",
        -29 => "Function not implemented",
        -30 => "Too much data",
        -31 => "Invalid device",
        -32 => "Unsupported firmware version",
        -33 => "Buffer is too small",
        -34 => "No data available",
        -35 => "Resource conflict",
        -36 => "EVM is required for external power",
        -37 => "Command is busy",
        -38 => "Adjustable power supply failure",
        -39 => "Not enabled",
        -40 => "I2C initialization failed",
        -41 => "I2C read error",
        -42 => "I2C write error",
        -43 => "I2C busy (transfer is pending)",
        -44 => "Address not acknowledged (NAK)",
        -45 => "Data not acknowledged (NAK)",
        -46 => "Read timeout",
        -47 => "Read data timeout",
        -48 => "Timeout waiting for read complete",
        -49 => "Write timeout",
        -50 => "Write data timeout",
        -51 => "Timeout waiting for write complete",
        -52 => "I2C not in Master mode",
        -53 => "I2C arbitration lost",
        -54 => "I2C pullups require 3.3V power",
        -60 => "SPI initialization failed",
        -61 => "SPI write/read error",
        -70 => "Data write error",
        -71 => "Data read error",
        -72 => "Operation timeout",
        -73 => "Data CRC failed",
        code if code > 0 => "Success",
        _ => return None,
    };
    Some(text)
}

/// Payload bytes of a packet, bounded by the declared length
pub fn payload_of(packet: &[u8]) -> &[u8] {
    let declared = packet.get(PACKET_PAYLOAD_LEN).copied().unwrap_or(0) as usize;
    let end = (PACKET_PAYLOAD + declared).min(packet.len());
    packet.get(PACKET_PAYLOAD..end).unwrap_or(&[])
}

/// Payload read as a big-endian integer
pub fn result_be(packet: &[u8]) -> u32 {
    payload_of(packet)
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

/// Payload read as a little-endian integer
pub fn result_le(packet: &[u8]) -> u32 {
    payload_of(packet)
        .iter()
        .rev()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

/// Kind of controller reported by the status command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerType {
    #[default]
    Unknown,
    Usb2any,
    OneDemo,
    Unsupported,
}

/// Asynchronous data pushed by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Usb2anyEvent {
    Payload(Vec<u8>),
    Interrupt(Vec<u8>),
}

/// Settings of a USB2ANY codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usb2anyParams {
    pub id: String,
    pub optional: bool,
    pub device_id: Option<String>,
    /// Time allowed for the controller handshake on connect
    pub connect_timeout_ms: u64,
    /// Time allowed for the firmware version reply to a ping
    pub ping_timeout_ms: u64,
    /// Commands allowed in flight before outbound packets are held back
    pub max_outstanding_commands: u32,
    /// Tell firmware checks not to update the controller
    pub no_firmware_change: bool,
}

impl Default for Usb2anyParams {
    fn default() -> Self {
        Self {
            id: "u2a".to_string(),
            optional: false,
            device_id: None,
            connect_timeout_ms: 250,
            ping_timeout_ms: 250,
            max_outstanding_commands: 30,
            no_firmware_change: false,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    connected: bool,
    packets_received: u64,
    packet_error_count: u32,
    tx_sequence: u8,
    rx_sequence: u8,
    controller: ControllerType,
    firmware_version: u32,
    version: String,
    controller_name: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connected: false,
            packets_received: 0,
            packet_error_count: 0,
            tx_sequence: 1,
            rx_sequence: 0,
            controller: ControllerType::Unknown,
            firmware_version: 0,
            version: String::new(),
            controller_name: String::new(),
        }
    }
}

pub struct Usb2anyCodec {
    core: CodecCore,
    messages: MessageCodecCore,
    params: Usb2anyParams,
    state: Mutex<SessionState>,
    frame_buffer: Mutex<Vec<u8>>,
    events: EventHub<Usb2anyEvent>,
}

impl Usb2anyCodec {
    pub fn new(params: Usb2anyParams) -> Self {
        let mut core = CodecCore::new(params.id.clone(), NodeKind::Codec)
            .with_encoder(data_type::U2A_PACKET_ENCODER, data_type::NOOP_DECODER)
            .with_decoder(binary_or_buffer(), data_type::BUFFER)
            .with_optional(params.optional);
        if let Some(device_id) = &params.device_id {
            core = core.with_device_id(device_id.clone());
        }
        Self {
            messages: MessageCodecCore::new(params.id.clone()),
            core,
            params,
            state: Mutex::new(SessionState::default()),
            frame_buffer: Mutex::new(Vec::new()),
            events: EventHub::new(),
        }
    }

    pub fn params(&self) -> &Usb2anyParams {
        &self.params
    }

    /// Run `check` on every connect, after the firmware version is read
    pub fn register_firmware_check(&self, name: impl Into<String>, check: Arc<dyn FirmwareCheck>) {
        self.messages.register_firmware_check(name, check);
    }

    pub fn unregister_firmware_check(&self, name: &str) {
        self.messages.unregister_firmware_check(name);
    }

    /// Payload and interrupt packets from the controller
    pub fn events(&self) -> &EventHub<Usb2anyEvent> {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().map(|s| s.connected).unwrap_or(false)
    }

    /// Firmware version as `a.b.c.d`, empty before the first connect
    pub fn firmware_version(&self) -> String {
        self.state
            .lock()
            .map(|s| s.version.clone())
            .unwrap_or_default()
    }

    pub fn controller_type(&self) -> ControllerType {
        self.state
            .lock()
            .map(|s| s.controller)
            .unwrap_or_default()
    }

    pub fn controller_name(&self) -> String {
        self.state
            .lock()
            .map(|s| s.controller_name.clone())
            .unwrap_or_default()
    }

    pub fn packets_received(&self) -> u64 {
        self.state.lock().map(|s| s.packets_received).unwrap_or(0)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| LinkError::Protocol(format!("{} state poisoned", self.core.id())))?;
        Ok(f(&mut state))
    }

    /// Build, send and return a command packet
    pub fn send_command_packet(&self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD {
            return Err(LinkError::Protocol(
                "Too much payload data for a single packet.".to_string(),
            ));
        }
        let sequence = self.with_state(|state| {
            if state.tx_sequence == 255 {
                state.tx_sequence = 1;
            }
            let sequence = state.tx_sequence;
            state.tx_sequence += 1;
            sequence
        })?;

        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        packet.extend_from_slice(&[
            PACKET_IDENTIFIER,
            0,
            payload.len() as u8,
            COMMAND_PACKET,
            0,
            sequence,
            0,
            cmd,
        ]);
        packet.extend_from_slice(payload);
        packet[PACKET_PEC] = crc8(&packet[PACKET_PAYLOAD_LEN..]);

        self.transmit(packet.clone())?;
        Ok(packet)
    }

    /// Wait for the reply to a packet sent with [`Self::send_command_packet`]
    ///
    /// The command is queued before this returns, so replies that arrive
    /// before the future is first polled are not lost. While connected, a
    /// failed command is sent once more with a fresh sequence number.
    pub fn read_response<'a>(
        &'a self,
        packet: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>>> + Send + 'a {
        let command = packet.get(PACKET_COMMAND).copied().unwrap_or(0);
        let sequence = packet.get(PACKET_SEQ_NUM).copied().unwrap_or(0);
        let payload = packet.get(PACKET_PAYLOAD..).unwrap_or(&[]).to_vec();
        let rx = self.messages.queue().add_command(u32::from(command), sequence);

        async move {
            let err = match wait_for_response(self.core.id(), rx).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if !self.is_connected() {
                return Err(err);
            }

            let reason = if err.is_missing_response() {
                "missing response".to_string()
            } else {
                err.to_string()
            };
            tracing::info!(
                codec = %self.core.id(),
                "Retrying command due to {} for command {}, seq# {}",
                reason,
                command,
                sequence
            );
            let retry = self.send_command_packet(command, &payload)?;
            let rx = self
                .messages
                .queue()
                .add_command(u32::from(command), retry[PACKET_SEQ_NUM]);
            wait_for_response(self.core.id(), rx).await
        }
    }

    /// Start the boot loader on the controller
    pub async fn invoke_bsl(&self) -> Result<Vec<u8>> {
        let packet = self.send_command_packet(command::INVOKE_BSL, &[])?;
        self.read_response(&packet).await
    }

    /// Whether a packet must wait until the controller catches up
    pub fn should_pause_transmission(&self, packet: &[u8]) -> bool {
        let sequence = packet.get(PACKET_SEQ_NUM).copied().unwrap_or(0);
        if sequence == 0 {
            return false;
        }
        let received = self.state.lock().map(|s| s.rx_sequence).unwrap_or(0);
        let mut diff = i32::from(sequence) - i32::from(received);
        if diff < 0 {
            diff += 255;
        }
        diff > self.params.max_outstanding_commands as i32
    }

    fn transmit(&self, packet: Vec<u8>) -> Result<()> {
        self.messages.transmit(
            packet,
            |p| self.should_pause_transmission(p),
            |p| self.core.send_to_parent(Payload::Bytes(p)),
        )
    }

    /// Split a byte stream into packets and decode each one
    fn detect_packets(&self, data: &[u8]) -> Result<()> {
        let frames = {
            let mut buffer = self
                .frame_buffer
                .lock()
                .map_err(|_| LinkError::Protocol(format!("{} frame buffer poisoned", self.core.id())))?;
            buffer.extend_from_slice(data);
            extract_frames(&mut buffer)
        };

        let mut first_error = None;
        for frame in frames {
            if let Err(e) = self.decode_packet(&frame) {
                tracing::warn!(codec = %self.core.id(), "{}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Decode one complete packet
    pub fn decode_packet(&self, raw: &[u8]) -> Result<()> {
        self.messages.packet_received(
            raw,
            |p| self.should_pause_transmission(p),
            |p| self.core.send_to_parent(Payload::Bytes(p)),
        )?;

        if raw.len() < PACKET_HEADER_SIZE {
            self.with_state(|s| s.packet_error_count += 1)?;
            return Err(packet_error(error_string(-23)));
        }
        let declared = usize::from(raw[PACKET_PAYLOAD_LEN]);
        if raw[0] != PACKET_IDENTIFIER || declared > MAX_PAYLOAD {
            return Err(packet_error(error_string(-28)));
        }
        let end = (PACKET_HEADER_SIZE + declared).min(raw.len());
        if raw[PACKET_PEC] != crc8(&raw[PACKET_PAYLOAD_LEN..end]) {
            tracing::warn!(
                codec = %self.core.id(),
                "ignoring USB2ANY error: {}",
                error_string(-13).unwrap_or_default()
            );
            return Ok(());
        }

        let sequence = raw[PACKET_SEQ_NUM];
        let command = u32::from(raw[PACKET_COMMAND]);
        match raw[PACKET_TYPE] {
            PAYLOAD_PACKET => self.events.emit(Usb2anyEvent::Payload(payload_of(raw).to_vec())),
            INTERRUPT_PACKET => self.events.emit(Usb2anyEvent::Interrupt(payload_of(raw).to_vec())),
            REPLY_PACKET => {
                self.with_state(|s| {
                    s.packet_error_count = 0;
                    if sequence != 0 {
                        s.rx_sequence = sequence;
                    }
                })?;
                self.messages
                    .queue()
                    .add_response(raw.to_vec(), command, Some(sequence));
            }
            ERROR_PACKET => {
                let code = i32::from(raw[PACKET_STATUS]) - 256;
                let message = error_string(code).unwrap_or_default().to_string();
                let repeated = self.with_state(|s| {
                    if sequence != 0 {
                        s.rx_sequence = sequence;
                    }
                    let repeated = s.packet_error_count > 0;
                    s.packet_error_count += 1;
                    repeated
                })?;
                self.messages
                    .queue()
                    .add_error_response(message.clone(), command, Some(sequence));
                if repeated {
                    return Err(LinkError::Device(format!("USB2ANY error: {}", message)));
                }
                tracing::warn!(
                    codec = %self.core.id(),
                    "USB2ANY error packet received: {} for command {}, seq# {}",
                    message,
                    command,
                    sequence
                );
            }
            _ => {}
        }
        self.with_state(|s| s.packets_received += 1)?;
        Ok(())
    }

    async fn open_controller(&self) -> Result<()> {
        let zero = [0u8; 4];
        let packet = self.send_command_packet(command::STATUS_GET_CONTROLLER_TYPE, &zero)?;
        let controller_reply = self.read_response(&packet).await?;
        let packet = self.send_command_packet(command::FIRMWARE_VERSION_READ, &zero)?;
        let firmware_reply = self.read_response(&packet).await?;

        let firmware = payload_of(&firmware_reply);
        let (firmware_version, version) = match <[u8; 4]>::try_from(firmware) {
            Ok(bytes) => (
                version_to_u32(bytes),
                format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]),
            ),
            Err(_) => (0, "UNKNOWN".to_string()),
        };
        let reported = reported_controller(&controller_reply);

        self.with_state(|s| {
            s.firmware_version = firmware_version;
            s.version = version;
            let (controller, name) = match reported {
                1 => (ControllerType::Usb2any, "USB2ANY"),
                2 => (ControllerType::OneDemo, "OneDemo"),
                _ if firmware_version == 0 => (ControllerType::Unknown, "<unknown device>"),
                _ => (ControllerType::Usb2any, "USB2ANY"),
            };
            s.controller = controller;
            s.controller_name = name.to_string();
            if firmware_version < MIN_FIRMWARE_REQUIRED {
                s.controller = ControllerType::Unsupported;
            }
        })?;

        if firmware_version < MIN_FIRMWARE_REQUIRED {
            return Err(LinkError::Device("Unsupported USB2ANY controller".to_string()));
        }
        Ok(())
    }

    fn reset_session(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = false;
            state.rx_sequence = 0;
            state.tx_sequence = 1;
            state.packet_error_count = 0;
            state.controller = ControllerType::Unknown;
        }
        if let Ok(mut buffer) = self.frame_buffer.lock() {
            buffer.clear();
        }
    }
}

fn reported_controller(reply: &[u8]) -> u8 {
    reply.get(PACKET_PAYLOAD).copied().unwrap_or(0)
}

fn packet_error(message: Option<&str>) -> LinkError {
    LinkError::Protocol(format!("USB2ANY error: {}", message.unwrap_or_default()))
}

/// Pull complete packets off the front of `buffer`, skipping bytes until 'T'
fn extract_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        match buffer.iter().position(|&b| b == PACKET_IDENTIFIER) {
            Some(0) => {}
            Some(start) => {
                buffer.drain(..start);
            }
            None => {
                buffer.clear();
                break;
            }
        }
        if buffer.len() < PACKET_HEADER_SIZE {
            break;
        }
        let length = usize::from(buffer[PACKET_PAYLOAD_LEN]) + PACKET_HEADER_SIZE;
        if buffer.len() < length {
            break;
        }
        frames.push(buffer.drain(..length).collect());
    }
    frames
}

#[async_trait]
impl Codec for Usb2anyCodec {
    fn core(&self) -> &CodecCore {
        &self.core
    }

    async fn on_connect(&self, log: &dyn ConnectionLog) -> Result<()> {
        self.with_state(|s| s.connected = true)?;

        let timeout = Duration::from_millis(self.params.connect_timeout_ms);
        let opened = match tokio::time::timeout(timeout, self.open_controller()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(
                "No response from USB2ANY controller.".to_string(),
            )),
        };
        if let Err(e) = opened {
            self.with_state(|s| s.connected = false)?;
            tracing::info!(codec = %self.core.id(), "{}", e);
            return Err(e);
        }

        log.add_debug_message(&format!(
            "{} firmware version {}",
            self.controller_name(),
            self.firmware_version()
        ));

        // Checks may wait on the user, so they run outside the connect timeout.
        let info = FirmwareInfo {
            detected_version: self.firmware_version(),
            model_id: self.core.id().to_string(),
            controller: "usb2any".to_string(),
        };
        if let Err(e) = self
            .messages
            .check_firmware(&info, self.params.no_firmware_change)
            .await
        {
            self.with_state(|s| s.connected = false)?;
            tracing::info!(codec = %self.core.id(), "{}", e);
            return Err(e);
        }

        // Green LED on; nobody waits for the reply.
        let packet = self.send_command_packet(command::LED_SET_STATE, &[2, 0])?;
        drop(self.read_response(&packet));
        Ok(())
    }

    async fn on_disconnect(&self, _log: &dyn ConnectionLog) -> Result<()> {
        self.reset_session();
        self.messages.reset();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.messages.ping()?;
        let packet = self.send_command_packet(command::FIRMWARE_VERSION_READ, &[0, 0, 0, 0])?;
        let timeout = Duration::from_millis(self.params.ping_timeout_ms);
        match tokio::time::timeout(timeout, self.read_response(&packet)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(LinkError::Timeout(format!(
                "Ping failure: no response of firmware version read from {}",
                self.core.id()
            ))),
        }
    }

    fn encode(&self, data: Payload) -> Result<()> {
        self.transmit(data.into_bytes())
    }

    fn decode(&self, data: Payload) -> Result<()> {
        self.detect_packets(data.as_bytes())
    }
}
