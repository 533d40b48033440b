//! Mock construction helpers

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use target_link::codec::{data_type, Codec, CodecCore, NodeKind, Payload};
use target_link::transport::ConnectionLog;
use target_link::usb::{InboundSink, PortKind, PortWriter, UsbPort, UsbService};
use target_link::{LinkError, ProgramLoader, Result};
use tokio::sync::Notify;

type WriteLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

/// USB service over a port list the test controls
#[derive(Default)]
pub struct MockUsbService {
    ports: Mutex<Vec<UsbPort>>,
    fail_open: AtomicBool,
    opened: Mutex<Vec<(String, Option<u32>)>>,
    closed: Arc<Mutex<Vec<String>>>,
    writes: WriteLog,
    sinks: Mutex<HashMap<String, InboundSink>>,
}

impl MockUsbService {
    pub fn new(ports: Vec<UsbPort>) -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(ports),
            ..Self::default()
        })
    }

    pub fn plug(&self, port: UsbPort) {
        self.ports.lock().unwrap().push(port);
    }

    pub fn unplug(&self, name: &str) {
        self.ports.lock().unwrap().retain(|p| p.name != name);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Port names and baud rates passed to `open`, in call order
    pub fn opened(&self) -> Vec<(String, Option<u32>)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    /// Feed bytes into an open port as if the device had sent them
    pub fn push_inbound(&self, port: &str, bytes: &[u8]) -> bool {
        let sink = self.sinks.lock().unwrap().get(port).cloned();
        match sink {
            Some(sink) => {
                sink(bytes.to_vec());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl UsbService for MockUsbService {
    async fn list_ports(&self, kind: PortKind, vendor_id: Option<u16>) -> Result<Vec<UsbPort>> {
        Ok(self
            .ports
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.kind == kind)
            .filter(|p| vendor_id.is_none() || p.vendor_id == vendor_id)
            .cloned()
            .collect())
    }

    async fn open(
        &self,
        port: &UsbPort,
        baud_rate: Option<u32>,
        inbound: InboundSink,
    ) -> Result<Box<dyn PortWriter>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(LinkError::Failure(format!("Access denied opening {}", port.name)));
        }
        self.opened.lock().unwrap().push((port.name.clone(), baud_rate));
        self.sinks.lock().unwrap().insert(port.name.clone(), inbound);
        Ok(Box::new(RecordingWriter {
            port: port.name.clone(),
            writes: self.writes.clone(),
            closed: self.closed.clone(),
        }))
    }
}

/// Writer that records everything written to it
pub struct RecordingWriter {
    port: String,
    writes: WriteLog,
    closed: Arc<Mutex<Vec<String>>>,
}

impl PortWriter for RecordingWriter {
    fn write(&self, data: &[u8]) -> Result<()> {
        self.writes.lock().unwrap().push((self.port.clone(), data.to_vec()));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.lock().unwrap().push(self.port.clone());
        Ok(())
    }
}

/// Leaf model that records inbound data and can be told to fail connecting
pub struct RecordingModel {
    core: CodecCore,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
    received: Mutex<Vec<Payload>>,
}

impl RecordingModel {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_core(CodecCore::new(id, NodeKind::Model))
    }

    pub fn optional(id: &str) -> Arc<Self> {
        Self::with_core(CodecCore::new(id, NodeKind::Model).with_optional(true))
    }

    pub fn for_device(id: &str, device_id: &str) -> Arc<Self> {
        Self::with_core(CodecCore::new(id, NodeKind::Model).with_device_id(device_id))
    }

    fn with_core(core: CodecCore) -> Arc<Self> {
        Arc::new(Self {
            core: core.with_decoder(data_type::BUFFER, data_type::BUFFER),
            fail_connect: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Payload> {
        self.received.lock().unwrap().clone()
    }

    /// Send bytes toward the transport
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        self.core.send_to_parent(Payload::Bytes(bytes.to_vec()))
    }
}

#[async_trait]
impl Codec for RecordingModel {
    fn core(&self) -> &CodecCore {
        &self.core
    }

    async fn on_connect(&self, _log: &dyn ConnectionLog) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(LinkError::Failure(format!("{} did not answer", self.core.id())));
        }
        Ok(())
    }

    fn decode(&self, data: Payload) -> Result<()> {
        self.received.lock().unwrap().push(data);
        Ok(())
    }
}

/// Leaf model whose connect does not finish until the test releases it
pub struct GatedModel {
    core: CodecCore,
    entered: Notify,
    release: Notify,
}

impl GatedModel {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            core: CodecCore::new(id, NodeKind::Model)
                .with_decoder(data_type::BUFFER, data_type::BUFFER),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Resolves once `on_connect` has started
    pub async fn connecting(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl Codec for GatedModel {
    fn core(&self) -> &CodecCore {
        &self.core
    }

    async fn on_connect(&self, _log: &dyn ConnectionLog) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Program loader with a scripted outcome
pub struct TestLoader {
    id: String,
    device_id: Option<String>,
    optional: bool,
    fail: AtomicBool,
    loads: Mutex<Vec<bool>>,
}

impl TestLoader {
    pub fn new(id: &str, device_id: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            device_id: device_id.map(str::to_string),
            optional: false,
            fail: AtomicBool::new(false),
            loads: Mutex::new(Vec::new()),
        })
    }

    pub fn optional(id: &str, device_id: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            device_id: device_id.map(str::to_string),
            optional: true,
            fail: AtomicBool::new(false),
            loads: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The `force` flag of every load, in call order
    pub fn loads(&self) -> Vec<bool> {
        self.loads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgramLoader for TestLoader {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    fn is_optional(&self) -> bool {
        self.optional
    }

    async fn load_program(
        &self,
        log: &dyn ConnectionLog,
        progress: Option<&target_link::connection::ProgressCallback>,
        force: bool,
    ) -> Result<()> {
        self.loads.lock().unwrap().push(force);
        if let Some(progress) = progress {
            progress(100.0);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinkError::Failure(format!("Flashing {} failed", self.id)));
        }
        log.add_progress_message(&format!("{} loaded", self.id), None);
        Ok(())
    }
}
