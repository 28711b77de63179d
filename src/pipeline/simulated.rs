//! In-process stand-in for the camera's media hardware.
//!
//! Validates formats against per-node capabilities, enforces the
//! connect/enable/disable/disconnect lifecycle, and on capture trigger
//! delivers scripted (or synthesised) buffers to enabled output callbacks
//! from one worker thread per output. Uses a builder pattern to configure
//! scripts, delays, silent outputs and error injection, and records every
//! call so tests can assert on ordering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::pipeline::backend::{BufferCallback, BufferChunk, MediaBackend};
use crate::pipeline::error::{PipelineError, Result};
use crate::pipeline::types::{Encoding, FrameSize, NodeKind, PortFormat, PortId};

/// Largest frame the simulated sensor produces.
pub const MAX_SENSOR_SIZE: FrameSize = FrameSize::new(3280, 2464);

/// Largest frame the simulated resizer produces.
pub const MAX_RESIZER_SIZE: FrameSize = FrameSize::new(1920, 1088);

const MAX_FRAMERATE: u32 = 90;

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    SetFormat(PortId),
    Commit(PortId),
    Connect { upstream: PortId, downstream: PortId },
    EnableConnection(PortId),
    DisableConnection(PortId),
    Disconnect(PortId),
    EnableOutput(PortId),
    DisableOutput(PortId),
    Capture { port: PortId, active: bool },
}

/// One chunk of a scripted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedChunk {
    pub data: Vec<u8>,
    pub end_of_frame: bool,
}

impl ScriptedChunk {
    pub fn new(data: impl Into<Vec<u8>>, end_of_frame: bool) -> Self {
        Self {
            data: data.into(),
            end_of_frame,
        }
    }
}

#[derive(Debug, Clone)]
struct ErrorInjection {
    operation: &'static str,
    port: Option<PortId>,
    reason: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct PortState {
    staged: Option<PortFormat>,
    committed: Option<PortFormat>,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    upstream: PortId,
    enabled: bool,
}

type CallbackSlot = Arc<Mutex<Option<BufferCallback>>>;

#[derive(Default)]
struct SimState {
    ports: HashMap<PortId, PortState>,
    /// Keyed by downstream input port.
    links: HashMap<PortId, Link>,
    outputs: HashMap<PortId, CallbackSlot>,
    capturing: HashSet<PortId>,
    generation: u64,
    scripts: HashMap<PortId, Vec<ScriptedChunk>>,
    silent: HashSet<PortId>,
    delays: HashMap<PortId, Duration>,
    error_injections: Vec<ErrorInjection>,
    events: Vec<BackendEvent>,
}

impl SimState {
    fn injected(&self, operation: &str, port: PortId) -> Option<String> {
        self.error_injections
            .iter()
            .find(|inj| {
                inj.operation == operation && (inj.port.is_none() || inj.port == Some(port))
            })
            .map(|inj| inj.reason.clone())
    }

    fn is_port_active(&self, port: PortId) -> bool {
        if port.is_output() {
            self.links
                .values()
                .any(|link| link.upstream == port && link.enabled)
                || self.outputs.contains_key(&port)
        } else {
            self.links.get(&port).is_some_and(|link| link.enabled)
        }
    }

    /// Whether `port`'s node receives frames from `source` through enabled links.
    fn is_fed_by(&self, port: PortId, source: PortId) -> bool {
        let mut node = port.node;
        // The graph is a tree rooted at the camera; bound the walk anyway.
        for _ in 0..8 {
            if node == NodeKind::Camera {
                return port == source;
            }
            let Some(link) = self.links.get(&PortId::input(node, 0)) else {
                return false;
            };
            if !link.enabled {
                return false;
            }
            if link.upstream.node == NodeKind::Camera {
                return link.upstream == source;
            }
            node = link.upstream.node;
        }
        false
    }
}

/// A fake media backend for testing without camera hardware.
#[derive(Clone)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBackend {
    /// Create a backend with no scripts: every output synthesises a frame
    /// from its committed format.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Deliver exactly these chunks on `port` each time capture is triggered.
    pub fn with_script(self, port: PortId, chunks: Vec<ScriptedChunk>) -> Self {
        self.state.lock().scripts.insert(port, chunks);
        self
    }

    /// Never deliver anything on `port`.
    pub fn with_silent_output(self, port: PortId) -> Self {
        self.state.lock().silent.insert(port);
        self
    }

    /// Wait this long after the trigger before delivering on `port`.
    pub fn with_delivery_delay(self, port: PortId, delay: Duration) -> Self {
        self.state.lock().delays.insert(port, delay);
        self
    }

    /// Fail `operation` (optionally only for `port`) with `reason`.
    ///
    /// Operation names: `"set_format"`, `"commit"`, `"connect"`,
    /// `"enable_connection"`, `"disable_connection"`, `"disconnect"`,
    /// `"enable_output"`, `"disable_output"`, `"set_capture"`.
    pub fn with_error(
        self,
        operation: &'static str,
        port: Option<PortId>,
        reason: impl Into<String>,
    ) -> Self {
        self.state.lock().error_injections.push(ErrorInjection {
            operation,
            port,
            reason: reason.into(),
        });
        self
    }

    /// Make `port` silent from now on.
    pub fn silence(&self, port: PortId) {
        self.state.lock().silent.insert(port);
    }

    /// Restore normal delivery on `port`.
    pub fn unsilence(&self, port: PortId) {
        self.state.lock().silent.remove(&port);
    }

    /// Every call made so far, in order.
    pub fn events(&self) -> Vec<BackendEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn committed_format(&self, port: PortId) -> Option<PortFormat> {
        self.state.lock().ports.get(&port).and_then(|p| p.committed)
    }

    pub fn is_capturing(&self, port: PortId) -> bool {
        self.state.lock().capturing.contains(&port)
    }

    /// Output ports that currently have a callback installed.
    pub fn enabled_outputs(&self) -> Vec<PortId> {
        self.state.lock().outputs.keys().copied().collect()
    }

    /// All connections as `(upstream, downstream, enabled)`.
    pub fn connections(&self) -> Vec<(PortId, PortId, bool)> {
        self.state
            .lock()
            .links
            .iter()
            .map(|(downstream, link)| (link.upstream, *downstream, link.enabled))
            .collect()
    }

    fn check_injection(state: &SimState, operation: &str, port: PortId) -> Result<()> {
        match state.injected(operation, port) {
            None => Ok(()),
            Some(reason) => Err(match operation {
                "set_format" | "commit" => PipelineError::configuration(port, reason),
                "connect" | "enable_connection" | "disable_connection" | "disconnect" => {
                    PipelineError::Connection(format!("{port}: {reason}"))
                }
                _ => PipelineError::Hardware(format!("{port}: {reason}")),
            }),
        }
    }

    fn spawn_delivery(
        &self,
        port: PortId,
        slot: CallbackSlot,
        chunks: Vec<ScriptedChunk>,
        delay: Option<Duration>,
        generation: u64,
    ) -> Result<()> {
        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name(format!("sim-{port}"))
            .spawn(move || {
                if let Some(delay) = delay {
                    std::thread::sleep(delay);
                }
                for chunk in &chunks {
                    {
                        let st = state.lock();
                        if st.generation != generation || st.capturing.is_empty() {
                            trace!("dropping stale delivery on {port}");
                            return;
                        }
                    }
                    let mut guard = slot.lock();
                    let Some(callback) = guard.as_mut() else {
                        return;
                    };
                    let finished =
                        callback(port, &BufferChunk::new(&chunk.data, chunk.end_of_frame));
                    if finished {
                        return;
                    }
                }
            })
            .map(|_| ())
            .map_err(|e| PipelineError::Hardware(format!("failed to spawn delivery thread: {e}")))
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a format against what the node behind `port` can do.
fn validate_format(port: PortId, format: &PortFormat) -> std::result::Result<(), String> {
    let raw = matches!(
        format.encoding,
        Encoding::Opaque | Encoding::I420 | Encoding::Yuyv
    );
    match (port.node, port.is_output()) {
        (NodeKind::Camera, true) | (NodeKind::Splitter, _) => {
            if !raw {
                return Err(format!("encoding {} not supported", format.encoding));
            }
        }
        (NodeKind::Resizer, true) => {
            if !matches!(format.encoding, Encoding::I420 | Encoding::Yuyv) {
                return Err(format!("encoding {} not supported", format.encoding));
            }
        }
        (NodeKind::LargeEncoder | NodeKind::SmallEncoder, true) => {
            if format.encoding != Encoding::Jpeg {
                return Err(format!("encoding {} not supported", format.encoding));
            }
        }
        (_, false) => {
            if !raw {
                return Err(format!("input encoding {} not supported", format.encoding));
            }
        }
        (_, true) => return Err("node has no outputs".to_string()),
    }

    if let Some(size) = format.size {
        if size.width == 0 || size.height == 0 {
            return Err(format!("frame size {size} is empty"));
        }
        let max = match port.node {
            NodeKind::Resizer if port.is_output() => MAX_RESIZER_SIZE,
            _ => MAX_SENSOR_SIZE.quantized(),
        };
        if size.width > max.width || size.height > max.height {
            return Err(format!("frame size {size} exceeds {max}"));
        }
    } else if port.node == NodeKind::Camera && port.index > 0 {
        return Err("camera capture ports need a frame size".to_string());
    }

    if let Some(fps) = format.framerate {
        if fps == 0 || fps > MAX_FRAMERATE {
            return Err(format!("framerate {fps} outside 1..={MAX_FRAMERATE}"));
        }
    }

    if let Some(q) = format.quality {
        if format.encoding != Encoding::Jpeg {
            return Err("quality only applies to JPEG".to_string());
        }
        if q == 0 || q > 100 {
            return Err(format!("JPEG quality {q} outside 1..=100"));
        }
    }
    Ok(())
}

/// Synthesise what the hardware would produce for a committed format.
fn synthesise_frame(port: PortId, format: Option<PortFormat>) -> Vec<ScriptedChunk> {
    let format = format.unwrap_or(PortFormat::new(Encoding::Opaque));
    let size = format.size.unwrap_or(FrameSize::new(32, 16));
    match format.encoding {
        Encoding::Jpeg => {
            let jpeg = fake_jpeg(size);
            if port.node == NodeKind::LargeEncoder {
                let (head, tail) = jpeg.split_at(jpeg.len() / 2);
                vec![
                    ScriptedChunk::new(head, false),
                    ScriptedChunk::new(tail, true),
                ]
            } else {
                vec![ScriptedChunk::new(jpeg, true)]
            }
        }
        Encoding::I420 => vec![ScriptedChunk::new(i420_frame(size), true)],
        Encoding::Yuyv => vec![ScriptedChunk::new(vec![0x80; size.pixel_count() * 2], true)],
        Encoding::Opaque => vec![ScriptedChunk::new(vec![0; 4], true)],
    }
}

/// A JPEG-shaped payload (SOI ... EOI) whose length scales with the frame.
fn fake_jpeg(size: FrameSize) -> Vec<u8> {
    let body = (size.pixel_count() / 64).clamp(16, 64 * 1024);
    let mut data = Vec::with_capacity(body + 4);
    data.extend_from_slice(&[0xFF, 0xD8]);
    data.extend((0..body).map(|i| (i % 251) as u8));
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// An I420 frame with a diagonal luma gradient and neutral chroma, laid
/// out on the aligned stride.
fn i420_frame(size: FrameSize) -> Vec<u8> {
    let aligned = size.quantized();
    let luma = aligned.pixel_count();
    let mut data = Vec::with_capacity(luma + luma / 2);
    for y in 0..aligned.height {
        for x in 0..aligned.width {
            data.push(((x + y) % 256) as u8);
        }
    }
    data.resize(luma + luma / 2, 0x80);
    data
}

impl MediaBackend for SimulatedBackend {
    fn set_format(&self, port: PortId, format: &PortFormat) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::SetFormat(port));
        Self::check_injection(&state, "set_format", port)?;
        if !port.exists() {
            return Err(PipelineError::configuration(port, "no such port"));
        }
        if state.is_port_active(port) {
            return Err(PipelineError::configuration(
                port,
                "port is enabled; disable before reconfiguring",
            ));
        }
        state.ports.entry(port).or_default().staged = Some(*format);
        Ok(())
    }

    fn commit(&self, port: PortId) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::Commit(port));
        Self::check_injection(&state, "commit", port)?;
        if !port.exists() {
            return Err(PipelineError::configuration(port, "no such port"));
        }
        if state.is_port_active(port) {
            return Err(PipelineError::configuration(
                port,
                "port is enabled; disable before committing",
            ));
        }
        let entry = state.ports.entry(port).or_default();
        let format = entry
            .staged
            .ok_or_else(|| PipelineError::configuration(port, "no format set"))?;
        validate_format(port, &format).map_err(|reason| {
            warn!("rejecting {format} on {port}: {reason}");
            PipelineError::configuration(port, reason)
        })?;
        entry.committed = Some(format);
        debug!("committed {format} on {port}");
        Ok(())
    }

    fn connect(&self, upstream: PortId, downstream: PortId) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::Connect {
            upstream,
            downstream,
        });
        Self::check_injection(&state, "connect", downstream)?;
        if !upstream.is_output() || downstream.is_output() {
            return Err(PipelineError::Connection(format!(
                "{upstream} -> {downstream}: must connect an output to an input"
            )));
        }
        for port in [upstream, downstream] {
            if state.ports.get(&port).and_then(|p| p.committed).is_none() {
                return Err(PipelineError::Connection(format!(
                    "{port} is not committed"
                )));
            }
        }
        if state.links.contains_key(&downstream) {
            return Err(PipelineError::Connection(format!(
                "{downstream} is already connected"
            )));
        }
        if state.links.values().any(|link| link.upstream == upstream) {
            return Err(PipelineError::Connection(format!(
                "{upstream} is already connected"
            )));
        }
        if upstream.node != NodeKind::Camera
            && !state
                .links
                .get(&PortId::input(upstream.node, 0))
                .is_some_and(|link| link.enabled)
        {
            return Err(PipelineError::Connection(format!(
                "{} has no enabled upstream producer",
                upstream.node.name()
            )));
        }
        state.links.insert(
            downstream,
            Link {
                upstream,
                enabled: false,
            },
        );
        Ok(())
    }

    fn enable_connection(&self, downstream: PortId) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::EnableConnection(downstream));
        Self::check_injection(&state, "enable_connection", downstream)?;
        let link = state
            .links
            .get_mut(&downstream)
            .ok_or_else(|| PipelineError::Connection(format!("{downstream} is not connected")))?;
        link.enabled = true;
        Ok(())
    }

    fn disable_connection(&self, downstream: PortId) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::DisableConnection(downstream));
        Self::check_injection(&state, "disable_connection", downstream)?;
        let link = state
            .links
            .get_mut(&downstream)
            .ok_or_else(|| PipelineError::Connection(format!("{downstream} is not connected")))?;
        link.enabled = false;
        Ok(())
    }

    fn disconnect(&self, downstream: PortId) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::Disconnect(downstream));
        Self::check_injection(&state, "disconnect", downstream)?;
        match state.links.get(&downstream) {
            None => Err(PipelineError::Connection(format!(
                "{downstream} is not connected"
            ))),
            Some(link) if link.enabled => Err(PipelineError::Connection(format!(
                "{downstream} must be disabled before disconnecting"
            ))),
            Some(_) => {
                state.links.remove(&downstream);
                Ok(())
            }
        }
    }

    fn enable_output(&self, port: PortId, callback: BufferCallback) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::EnableOutput(port));
        Self::check_injection(&state, "enable_output", port)?;
        if !port.is_output() || !port.exists() {
            return Err(PipelineError::Hardware(format!("{port} is not an output")));
        }
        if state.ports.get(&port).and_then(|p| p.committed).is_none() {
            return Err(PipelineError::Hardware(format!("{port} is not committed")));
        }
        if state.outputs.contains_key(&port) {
            return Err(PipelineError::Hardware(format!("{port} is already enabled")));
        }
        state
            .outputs
            .insert(port, Arc::new(Mutex::new(Some(callback))));
        Ok(())
    }

    fn disable_output(&self, port: PortId) -> Result<()> {
        let slot = {
            let mut state = self.state.lock();
            state.events.push(BackendEvent::DisableOutput(port));
            Self::check_injection(&state, "disable_output", port)?;
            state.outputs.remove(&port)
        };
        // Taking the callback waits out any delivery still running on it.
        if let Some(slot) = slot {
            drop(slot.lock().take());
        }
        Ok(())
    }

    fn set_capture(&self, port: PortId, active: bool) -> Result<()> {
        let deliveries = {
            let mut state = self.state.lock();
            state.events.push(BackendEvent::Capture { port, active });
            Self::check_injection(&state, "set_capture", port)?;
            if port.node != NodeKind::Camera || !port.is_output() {
                return Err(PipelineError::Hardware(format!(
                    "{port} has no capture parameter"
                )));
            }
            if !active {
                state.capturing.remove(&port);
                return Ok(());
            }
            if state.ports.get(&port).and_then(|p| p.committed).is_none() {
                return Err(PipelineError::Hardware(format!("{port} is not committed")));
            }
            state.capturing.insert(port);
            state.generation += 1;
            let generation = state.generation;

            let mut deliveries = Vec::new();
            for (out, slot) in &state.outputs {
                if state.silent.contains(out) || !state.is_fed_by(*out, port) {
                    continue;
                }
                let chunks = match state.scripts.get(out) {
                    Some(script) => script.clone(),
                    None => synthesise_frame(
                        *out,
                        state.ports.get(out).and_then(|p| p.committed),
                    ),
                };
                deliveries.push((
                    *out,
                    Arc::clone(slot),
                    chunks,
                    state.delays.get(out).copied(),
                    generation,
                ));
            }
            deliveries
        };

        for (out, slot, chunks, delay, generation) in deliveries {
            self.spawn_delivery(out, slot, chunks, delay, generation)?;
        }
        Ok(())
    }
}
