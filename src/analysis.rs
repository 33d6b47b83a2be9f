use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

/// Magnitude of `target_freq` in `samples`, normalised to full scale.
pub fn goertzel(samples: &[i16], sample_rate: u32, target_freq: f32) -> f32 {
    let n = samples.len();
    if n == 0 {
        return 0.0;
    }
    let k = (target_freq * n as f32 / sample_rate as f32).round() as usize;
    let omega = 2.0 * PI * k as f32 / n as f32;
    let coeff = 2.0 * omega.cos();

    let mut s1 = 0.0f32;
    let mut s2 = 0.0f32;

    for &sample in samples {
        let s0 = sample as f32 / i16::MAX as f32 + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }

    let power = s1 * s1 + s2 * s2 - s1 * s2 * coeff;
    power.max(0.0).sqrt()
}

/// Frequency of the strongest spectral peak, refined by parabolic
/// interpolation between neighbouring bins.
pub fn dominant_frequency(samples: &[i16], sample_rate: u32) -> Option<f32> {
    let n = samples.len();
    if n < 4 {
        return None;
    }

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n);

    let mut buffer: Vec<Complex<f32>> = samples
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let window = 0.5 - 0.5 * (2.0 * PI * i as f32 / (n - 1) as f32).cos();
            Complex::new(s as f32 / i16::MAX as f32 * window, 0.0)
        })
        .collect();

    fft.process(&mut buffer);

    let magnitudes: Vec<f32> = buffer.iter().take(n / 2 + 1).map(|c| c.norm()).collect();
    let (peak, &peak_mag) = magnitudes
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(b.1))?;

    if peak_mag <= f32::EPSILON {
        return None;
    }

    let offset = if peak + 1 < magnitudes.len() {
        let (l, c, r) = (magnitudes[peak - 1], peak_mag, magnitudes[peak + 1]);
        let denom = l - 2.0 * c + r;
        if denom.abs() > f32::EPSILON {
            0.5 * (l - r) / denom
        } else {
            0.0
        }
    } else {
        0.0
    };

    Some((peak as f32 + offset) * sample_rate as f32 / n as f32)
}

/// Largest violation of the sine recurrence `x[n+1] = 2cos(w)x[n] - x[n-1]`,
/// in sample units.
///
/// Rounding to 16-bit keeps this at or below 2.0 for an unbroken tone;
/// a phase jump anywhere in `samples` shows up as a much larger value.
pub fn continuity_residual(samples: &[i16], phase_increment: f64) -> f64 {
    let coeff = 2.0 * phase_increment.cos();
    samples
        .windows(3)
        .map(|w| (w[2] as f64 - coeff * w[1] as f64 + w[0] as f64).abs())
        .fold(0.0, f64::max)
}

/// Largest absolute sample value.
pub fn peak_magnitude(samples: &[i16]) -> i32 {
    samples.iter().map(|&s| (s as i32).abs()).max().unwrap_or(0)
}
