use crate::AMPLITUDE;
use byteorder::{ByteOrder, LittleEndian};
use std::f64::consts::TAU;

/// Sine oscillator driven by a running phase accumulator.
///
/// The phase is wrapped by subtracting whole turns rather than resetting,
/// so consecutive blocks join without a discontinuity. The per-sample
/// increment is reduced modulo 2π up front, so a single subtraction
/// always brings the phase back into range whatever the frequency.
#[derive(Debug, Clone)]
pub struct Oscillator {
    amplitude: f64,
    phase: f64,
    phase_increment: f64,
}

impl Oscillator {
    /// `amplitude` is capped at [`AMPLITUDE`]. A zero sample rate yields silence.
    pub fn new(frequency_hz: i32, sample_rate: u32, amplitude: f32) -> Self {
        let mut phase_increment = if sample_rate == 0 {
            0.0
        } else {
            (TAU * frequency_hz as f64 / sample_rate as f64).rem_euclid(TAU)
        };
        if phase_increment >= TAU {
            phase_increment = 0.0;
        }

        Self {
            amplitude: limit_amplitude(amplitude) as f64,
            phase: 0.0,
            phase_increment,
        }
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn phase_increment(&self) -> f64 {
        self.phase_increment
    }

    pub fn next_sample(&mut self) -> i16 {
        let value = (self.phase.sin() * self.amplitude * i16::MAX as f64).round();
        self.phase += self.phase_increment;
        if self.phase >= TAU {
            self.phase -= TAU;
        }
        value as i16
    }

    pub fn fill(&mut self, block: &mut [i16]) {
        for sample in block.iter_mut() {
            *sample = self.next_sample();
        }
    }
}

/// Clamps an output amplitude into `0.0..=AMPLITUDE`; NaN maps to `AMPLITUDE`.
pub fn limit_amplitude(amplitude: f32) -> f32 {
    if amplitude.is_nan() {
        AMPLITUDE
    } else {
        amplitude.clamp(0.0, AMPLITUDE)
    }
}

/// Largest magnitude a sample can reach at the given amplitude.
pub fn peak_amplitude(amplitude: f32) -> i16 {
    (amplitude as f64 * i16::MAX as f64).round() as i16
}

/// Packs samples as 16-bit little-endian PCM, replacing the contents of `out`.
pub fn encode_block(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.resize(samples.len() * 2, 0);
    LittleEndian::write_i16_into(samples, out);
}

/// Unpacks 16-bit little-endian PCM. A trailing odd byte is ignored.
pub fn decode_block(bytes: &[u8]) -> Vec<i16> {
    let even = bytes.len() - bytes.len() % 2;
    let mut samples = vec![0i16; even / 2];
    LittleEndian::read_i16_into(&bytes[..even], &mut samples);
    samples
}
