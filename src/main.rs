use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use paw_tone_core::{
    analysis::{continuity_residual, dominant_frequency, goertzel, peak_magnitude},
    audio::DEFAULT_BLOCK_BYTES,
    engine::ToneEngine,
    sink::MemorySinkFactory,
    synth::{encode_block, peak_amplitude, Oscillator},
    aliases, is_above_adult_hearing, Config, Preset, AMPLITUDE, DEFAULT_FREQUENCY_HZ,
    DEFAULT_STOP_GRACE_MS,
};
use std::fs::File;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "paw-tone")]
#[command(about = "High-frequency tone generator for pet deterrence", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a continuous tone on the default output device
    Play {
        /// Tone frequency in Hz
        #[arg(long, short, conflicts_with = "preset")]
        frequency: Option<i32>,

        /// Named preset (dog, cat, mouse, bird, max)
        #[arg(long, short)]
        preset: Option<Preset>,

        /// Seconds to play; without it, plays until Enter or end of input
        #[arg(long, short)]
        duration: Option<f32>,

        /// Output amplitude (0.0 - 0.8)
        #[arg(long, default_value_t = AMPLITUDE)]
        volume: f32,

        /// Milliseconds stop() waits for the synthesis thread
        #[arg(long, default_value_t = DEFAULT_STOP_GRACE_MS)]
        grace_ms: u64,
    },

    /// Control playback from stdin: a frequency, a preset, play, stop, status, quit
    Interactive {
        /// Output amplitude (0.0 - 0.8)
        #[arg(long, default_value_t = AMPLITUDE)]
        volume: f32,
    },

    /// List the built-in presets
    Presets,

    /// List available audio devices
    Devices,

    /// Render a tone through the engine into a raw s16le mono file
    Render {
        #[arg(long, short)]
        frequency: i32,

        #[arg(long, default_value = "1000")]
        duration_ms: u32,

        #[arg(long, short)]
        output: String,
    },

    /// Render a tone through the engine and report what was produced
    Analyze {
        #[arg(long, short, default_value_t = DEFAULT_FREQUENCY_HZ)]
        frequency: i32,

        #[arg(long, default_value = "200")]
        duration_ms: u32,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play {
            frequency,
            preset,
            duration,
            volume,
            grace_ms,
        } => {
            let frequency = frequency
                .or(preset.map(|p| p.frequency_hz()))
                .unwrap_or(DEFAULT_FREQUENCY_HZ);
            let config = Config {
                amplitude: volume.clamp(0.0, AMPLITUDE),
                stop_grace_ms: grace_ms,
                ..Default::default()
            };
            play(frequency, duration, config)?;
        }

        Commands::Interactive { volume } => {
            let config = Config {
                amplitude: volume.clamp(0.0, AMPLITUDE),
                ..Default::default()
            };
            interactive(config)?;
        }

        Commands::Presets => {
            println!("Presets:");
            for preset in Preset::ALL {
                let hz = preset.frequency_hz();
                let note = if is_above_adult_hearing(hz) {
                    "  (inaudible to most adults)"
                } else {
                    ""
                };
                println!("  {:<6} {:>6} Hz{}", preset.name(), hz, note);
            }
        }

        Commands::Devices => {
            let devices = paw_tone_core::audio::list_audio_devices();
            println!("Output devices:");
            for device in devices {
                println!("  {}", device);
            }
        }

        Commands::Render {
            frequency,
            duration_ms,
            output,
        } => {
            let samples = render(frequency, duration_ms)?;
            let mut bytes = Vec::new();
            encode_block(&samples, &mut bytes);
            File::create(&output)?.write_all(&bytes)?;
            eprintln!("Wrote {} samples to {}", samples.len(), output);
        }

        Commands::Analyze {
            frequency,
            duration_ms,
        } => {
            analyze(frequency, duration_ms)?;
        }
    }

    Ok(())
}

fn announce(frequency: i32) {
    eprintln!("Playing {} Hz", frequency);
    if is_above_adult_hearing(frequency) {
        eprintln!("Warning: this tone may be inaudible to you but not to your pet");
    }
}

fn play(frequency: i32, duration: Option<f32>, config: Config) -> Result<()> {
    let engine = ToneEngine::with_cpal(config);
    engine.play(frequency)?;
    announce(frequency);

    match duration {
        Some(secs) => {
            let deadline = Instant::now() + Duration::from_secs_f32(secs.max(0.0));
            while Instant::now() < deadline && engine.is_playing() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        None => {
            eprintln!("Press Enter to stop");
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
        }
    }

    let dropped = !engine.is_playing();
    engine.release();

    if dropped {
        match engine.take_last_error() {
            Some(err) => bail!("Playback stopped unexpectedly: {}", err),
            None => bail!("Playback stopped unexpectedly"),
        }
    }
    eprintln!("Stopped");
    Ok(())
}

fn interactive(config: Config) -> Result<()> {
    let engine = ToneEngine::with_cpal(config);
    let mut current = DEFAULT_FREQUENCY_HZ;

    eprintln!(
        "Frequency {} Hz. Commands: <hz>, <preset>, play, stop, status, quit",
        current
    );

    for line in io::stdin().lock().lines() {
        let line = line?;
        let command = line.trim();

        match command {
            "" => continue,
            "quit" | "exit" => break,
            "play" => match engine.play(current) {
                Ok(()) => announce(current),
                Err(e) => eprintln!("Error: {}", e),
            },
            "stop" => {
                engine.stop();
                eprintln!("Stopped");
            }
            "status" => {
                eprintln!(
                    "{} at {} Hz",
                    if engine.is_playing() { "Playing" } else { "Idle" },
                    current
                );
            }
            other => {
                let selected = match other.parse::<i32>() {
                    Ok(hz) => Ok(hz),
                    Err(_) => other.parse::<Preset>().map(|p| p.frequency_hz()),
                };
                match selected {
                    Ok(hz) if hz > 0 => {
                        current = hz;
                        eprintln!("Frequency {} Hz", current);
                        // Follow the new frequency only if a tone is already sounding.
                        if engine.is_playing() {
                            match engine.play(current) {
                                Ok(()) => announce(current),
                                Err(e) => eprintln!("Error: {}", e),
                            }
                        }
                    }
                    Ok(hz) => eprintln!("Error: frequency must be positive, got {}", hz),
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
        }
    }

    engine.release();
    Ok(())
}

/// Runs one engine session against an in-memory sink paced at four times
/// real time, and returns the first `duration_ms` worth of samples.
fn render(frequency: i32, duration_ms: u32) -> Result<Vec<i16>> {
    let config = Config::default();
    let wanted = (config.sample_rate as u64 * duration_ms as u64 / 1000) as usize;
    let block_secs = (DEFAULT_BLOCK_BYTES / 2) as f64 / config.sample_rate as f64;
    let factory = MemorySinkFactory::new(DEFAULT_BLOCK_BYTES)
        .with_write_delay(Duration::from_secs_f64(block_secs / 4.0));

    let engine = ToneEngine::new(Arc::new(factory.clone()), config);
    engine.play(frequency)?;
    while engine.is_playing() && factory.sample_count() < wanted {
        std::thread::sleep(Duration::from_millis(5));
    }
    let completed = engine.is_playing();
    engine.release();

    if !completed {
        bail!("Render session ended before producing {} samples", wanted);
    }

    let mut samples = factory.sessions().into_iter().next().unwrap_or_default();
    samples.truncate(wanted);
    Ok(samples)
}

fn analyze(frequency: i32, duration_ms: u32) -> Result<()> {
    let config = Config::default();
    let samples = render(frequency, duration_ms)?;
    let increment =
        Oscillator::new(frequency, config.sample_rate, config.amplitude).phase_increment();

    let measured = dominant_frequency(&samples, config.sample_rate);
    let peak = peak_magnitude(&samples);
    let ceiling = peak_amplitude(config.amplitude) as i32;
    let residual = continuity_residual(&samples, increment);
    // A sine of amplitude A over N samples gives a Goertzel magnitude of A*N/2.
    let level =
        2.0 * goertzel(&samples, config.sample_rate, frequency as f32) / samples.len().max(1) as f32;

    println!("Requested:  {} Hz", frequency);
    match measured {
        Some(hz) => println!("Measured:   {:.1} Hz", hz),
        None => println!("Measured:   no tone detected"),
    }
    println!("Level:      {:.3} of full scale at {} Hz", level, frequency);
    println!("Samples:    {}", samples.len());
    println!("Peak:       {} (ceiling {})", peak, ceiling);
    println!("Continuity: max residual {:.2} LSB", residual);

    if aliases(frequency, config.sample_rate) {
        println!("Note: {} Hz is at or above Nyquist and aliases", frequency);
    }
    if peak > ceiling {
        bail!("Peak amplitude above ceiling");
    }

    Ok(())
}
