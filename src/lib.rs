pub mod analysis;
pub mod audio;
pub mod engine;
pub mod error;
pub mod sink;
pub mod synth;

pub use analysis::*;
pub use audio::*;
pub use engine::*;
pub use error::*;
pub use sink::*;
pub use synth::*;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const SAMPLE_RATE: u32 = 44100;
pub const CHANNELS: u16 = 1;
pub const BIT_DEPTH: u16 = 16;
/// Fixed output ceiling, never full scale.
pub const AMPLITUDE: f32 = 0.8;
pub const DEFAULT_STOP_GRACE_MS: u64 = 100;
pub const DEFAULT_FREQUENCY_HZ: i32 = 15000;
pub const HIGH_FREQUENCY_WARNING_HZ: i32 = 17000;
pub const NYQUIST_HZ: u32 = SAMPLE_RATE / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Dog,
    Cat,
    Mouse,
    Bird,
    Max,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Dog,
        Preset::Cat,
        Preset::Mouse,
        Preset::Bird,
        Preset::Max,
    ];

    pub fn frequency_hz(&self) -> i32 {
        match self {
            Preset::Dog => 18000,
            Preset::Cat => 20000,
            Preset::Mouse => 22000,
            Preset::Bird => 8000,
            Preset::Max => 22000,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Dog => "dog",
            Preset::Cat => "cat",
            Preset::Mouse => "mouse",
            Preset::Bird => "bird",
            Preset::Max => "max",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = ToneError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Preset::ALL
            .iter()
            .copied()
            .find(|p| p.name() == wanted)
            .ok_or_else(|| ToneError::InvalidArgument(format!("Unknown preset: {}", s)))
    }
}

/// True when most adults can no longer hear the tone.
pub fn is_above_adult_hearing(frequency_hz: i32) -> bool {
    frequency_hz > HIGH_FREQUENCY_WARNING_HZ
}

/// True when the tone sits at or above Nyquist and will alias.
pub fn aliases(frequency_hz: i32, sample_rate: u32) -> bool {
    frequency_hz as i64 >= (sample_rate / 2) as i64
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sample_rate: u32,
    pub amplitude: f32,
    pub stop_grace_ms: u64,
}

impl Config {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn nyquist(&self) -> u32 {
        self.sample_rate / 2
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            amplitude: AMPLITUDE,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
        }
    }
}
