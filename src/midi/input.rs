// MIDI Input - external clock and transport into the realtime queue

use crate::error::SyncError;
use crate::midi::queue::RealtimeProducer;
use midir::{Ignore, MidiInput as MidirInput, MidiInputConnection};

/// Open connection feeding a RealtimeProducer
///
/// The connection closes when this is dropped.
pub struct MidiClockInput {
    connection: Option<MidiInputConnection<()>>,
    port_name: Option<String>,
}

impl MidiClockInput {
    /// Connect to the port whose name contains `port_hint`, or the first one
    ///
    /// With no input ports the sync engine keeps running without MIDI sync.
    pub fn open(port_hint: Option<&str>, mut producer: RealtimeProducer) -> Result<Self, SyncError> {
        let mut midi_in =
            MidirInput::new("loopsync clock input").map_err(|e| SyncError::MidiInit(e.to_string()))?;
        // midir drops timing messages unless told otherwise
        midi_in.ignore(Ignore::SysexAndActiveSense);

        let ports = midi_in.ports();
        if ports.is_empty() {
            log::warn!("No MIDI input port detected, MIDI sync disabled");
            return Ok(Self {
                connection: None,
                port_name: None,
            });
        }

        for (i, port) in ports.iter().enumerate() {
            if let Ok(name) = midi_in.port_name(port) {
                log::info!("MIDI input [{}] {}", i, name);
            }
        }

        let port = port_hint
            .and_then(|hint| {
                ports.iter().find(|p| {
                    midi_in
                        .port_name(p)
                        .map(|name| name.contains(hint))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(&ports[0]);
        let port_name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());

        let connection = midi_in
            .connect(
                port,
                "loopsync-clock-in",
                move |_timestamp, message, _| {
                    // Runs on the midir thread; timestamps come from the queue epoch
                    producer.add_bytes(message);
                },
                (),
            )
            .map_err(|e| SyncError::MidiConnect(e.to_string()))?;

        log::info!("Receiving MIDI clock from: {}", port_name);
        Ok(Self {
            connection: Some(connection),
            port_name: Some(port_name),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }
}
