// Command types - audio thread → clock generator, control → audio config

use crate::config::SyncConfig;
use crate::diagnostics::Diagnostics;
use crate::messaging::channels::{Receiver, Sender, spsc_channel};
use std::sync::Arc;

/// Requests from the ClockTransport to the timer thread generating clocks
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportCommand {
    /// Clock tempo, 0 stops clock output
    SetTempo(f64),
    Start,
    /// Resume, optionally sending a Song Position first
    Continue { song_position: Option<u16> },
    Stop {
        send_transport: bool,
        stop_clocks: bool,
    },
    /// Start clocks without a transport message
    StartClocks,
}

/// Control-side half of the configuration hand-off
///
/// Every published config stays referenced here until the audio side has
/// dropped it, so the audio thread never frees one.
pub struct ConfigPublisher {
    sender: Sender<Arc<SyncConfig>>,
    retained: Vec<Arc<SyncConfig>>,
    diagnostics: Arc<Diagnostics>,
}

/// Audio-side half, read once per block
pub struct ConfigReceiver {
    receiver: Receiver<Arc<SyncConfig>>,
    current: Arc<SyncConfig>,
}

pub fn config_channel(
    initial: SyncConfig,
    diagnostics: Arc<Diagnostics>,
) -> (ConfigPublisher, ConfigReceiver) {
    let (sender, receiver) = spsc_channel(8, diagnostics.clone());
    let current = Arc::new(initial);
    let publisher = ConfigPublisher {
        sender,
        retained: vec![current.clone()],
        diagnostics,
    };
    (publisher, ConfigReceiver { receiver, current })
}

impl ConfigPublisher {
    /// Validate and publish a replacement config
    ///
    /// Returns false if the audio side has not picked up earlier ones yet.
    pub fn publish(&mut self, mut config: SyncConfig) -> bool {
        self.collect();
        config.validate();
        let config = Arc::new(config);
        if self.sender.send(config.clone()) {
            self.retained.push(config);
            true
        } else {
            self.diagnostics
                .warn(format_args!("config publish dropped, receiver is behind"));
            false
        }
    }

    /// Free configs the audio side no longer references
    pub fn collect(&mut self) -> usize {
        let before = self.retained.len();
        let last = self.retained.len().saturating_sub(1);
        let mut index = 0;
        // The newest entry is kept even when unreferenced, it may still be in flight
        self.retained.retain(|config| {
            let keep = index == last || Arc::strong_count(config) > 1;
            index += 1;
            keep
        });
        before - self.retained.len()
    }

    pub fn retained(&self) -> usize {
        self.retained.len()
    }
}

impl ConfigReceiver {
    /// Swap in the newest published config, true if it changed
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Some(config) = self.receiver.recv() {
            self.current = config;
            changed = true;
        }
        changed
    }

    pub fn current(&self) -> &SyncConfig {
        &self.current
    }
}
