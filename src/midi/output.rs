// MIDI Output - destination for generated clock and transport bytes

use crate::error::SyncError;
use midir::{MidiOutput as MidirOutput, MidiOutputConnection};
use std::sync::{Arc, Mutex};

/// Anything that can receive raw MIDI bytes from the clock generator
pub trait MidiSink: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SyncError>;
}

impl MidiSink for MidiOutputConnection {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SyncError> {
        MidiOutputConnection::send(self, bytes).map_err(|e| SyncError::MidiSend(e.to_string()))
    }
}

/// Sink used when no output port is available, the loopback still runs
#[derive(Debug, Default)]
pub struct NullSink;

impl MidiSink for NullSink {
    fn send(&mut self, _bytes: &[u8]) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Sink that keeps a copy of everything sent, for monitoring and tests
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far
    pub fn messages(&self) -> Vec<Vec<u8>> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Status bytes only, convenient for asserting on realtime traffic
    pub fn status_bytes(&self) -> Vec<u8> {
        self.messages()
            .iter()
            .filter_map(|m| m.first().copied())
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

impl MidiSink for CaptureSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SyncError> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|e| SyncError::MidiSend(e.to_string()))?;
        sent.push(bytes.to_vec());
        Ok(())
    }
}

/// Open an output port whose name contains `port_hint`, or the first one
///
/// Returns a NullSink when the system has no MIDI outputs.
pub fn open_output(port_hint: Option<&str>) -> Result<Box<dyn MidiSink>, SyncError> {
    let midi_out =
        MidirOutput::new("loopsync clock output").map_err(|e| SyncError::MidiInit(e.to_string()))?;

    let ports = midi_out.ports();
    if ports.is_empty() {
        log::warn!("No MIDI output port detected, clock output disabled");
        return Ok(Box::new(NullSink));
    }

    for (i, port) in ports.iter().enumerate() {
        if let Ok(name) = midi_out.port_name(port) {
            log::info!("MIDI output [{}] {}", i, name);
        }
    }

    let port = port_hint
        .and_then(|hint| {
            ports.iter().find(|p| {
                midi_out
                    .port_name(p)
                    .map(|name| name.contains(hint))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(&ports[0]);

    let port_name = midi_out
        .port_name(port)
        .unwrap_or_else(|_| "Unknown".to_string());

    let connection = midi_out
        .connect(port, "loopsync-clock-out")
        .map_err(|e| SyncError::MidiConnect(e.to_string()))?;

    log::info!("Sending MIDI clock to: {}", port_name);
    Ok(Box::new(connection))
}
