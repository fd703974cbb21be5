// MIDI realtime events - clock, transport and song position

pub const MS_CLOCK: u8 = 0xF8;
pub const MS_START: u8 = 0xFA;
pub const MS_CONTINUE: u8 = 0xFB;
pub const MS_STOP: u8 = 0xFC;
pub const MS_SONG_POSITION: u8 = 0xF2;

/// MIDI clocks per quarter note
pub const CLOCKS_PER_BEAT: u32 = 24;

/// Clocks per Song Position unit (one sixteenth note)
pub const CLOCKS_PER_SONG_POSITION: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeMessage {
    Clock,
    Start,
    Continue,
    Stop,
    /// 14-bit position in sixteenth notes
    SongPosition(u16),
}

/// Realtime message with the producer-side timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeEvent {
    pub message: RealtimeMessage,
    pub timestamp_us: u64,
}

impl RealtimeMessage {
    /// Parse a raw MIDI message, anything but the realtime subset is ignored
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let status = *bytes.first()?;

        match status {
            MS_CLOCK => Some(RealtimeMessage::Clock),
            MS_START => Some(RealtimeMessage::Start),
            MS_CONTINUE => Some(RealtimeMessage::Continue),
            MS_STOP => Some(RealtimeMessage::Stop),
            MS_SONG_POSITION => {
                if bytes.len() >= 3 {
                    // LSB first, 7 bits each
                    let lsb = (bytes[1] & 0x7F) as u16;
                    let msb = (bytes[2] & 0x7F) as u16;
                    Some(RealtimeMessage::SongPosition((msb << 7) | lsb))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Encode into `buffer`, returns the number of bytes written
    pub fn write_bytes(&self, buffer: &mut [u8; 3]) -> usize {
        match *self {
            RealtimeMessage::Clock => {
                buffer[0] = MS_CLOCK;
                1
            }
            RealtimeMessage::Start => {
                buffer[0] = MS_START;
                1
            }
            RealtimeMessage::Continue => {
                buffer[0] = MS_CONTINUE;
                1
            }
            RealtimeMessage::Stop => {
                buffer[0] = MS_STOP;
                1
            }
            RealtimeMessage::SongPosition(position) => {
                let position = position & 0x3FFF;
                buffer[0] = MS_SONG_POSITION;
                buffer[1] = (position & 0x7F) as u8;
                buffer[2] = (position >> 7) as u8;
                3
            }
        }
    }

    /// Clock number a Song Position value refers to
    pub fn song_position_clock(position: u16) -> u64 {
        position as u64 * CLOCKS_PER_SONG_POSITION as u64
    }
}
