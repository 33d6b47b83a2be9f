//! Continuous tone playback.
//!
//! A [`ToneEngine`] runs at most one playback session at a time. Each
//! session owns a synthesis thread, and that thread alone opens, writes
//! and closes the output sink. The control side only flips the session's
//! stop flag and waits, for a bounded grace period, for the thread to
//! report that the sink has been released. If the thread misses the grace
//! period, the control side releases the sink through its
//! [`SinkRelease`] handle and detaches. Sessions also hold a device lease
//! from open to close, so a new session cannot open the device until a
//! detached thread has let go of it.

use crate::audio::CpalSinkFactory;
use crate::error::{Result, SinkError, ToneError};
use crate::sink::{AudioSink, SinkFactory, SinkRelease, StreamSpec};
use crate::synth::{encode_block, limit_amplitude, Oscillator};
use crate::{aliases, Config};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Starting,
    Playing,
    Stopping,
}

impl EngineState {
    fn to_bits(self) -> u64 {
        match self {
            EngineState::Idle => 0,
            EngineState::Starting => 1,
            EngineState::Playing => 2,
            EngineState::Stopping => 3,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & STATE_MASK {
            1 => EngineState::Starting,
            2 => EngineState::Playing,
            3 => EngineState::Stopping,
            _ => EngineState::Idle,
        }
    }
}

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Session generation and [`EngineState`] packed into one atomic word.
///
/// A synthesis thread only ever moves the word away from the exact
/// `(generation, Playing)` value it was started with, so a loop that
/// outlived its session cannot touch the state of a newer one.
#[derive(Debug, Default)]
struct StateWord(AtomicU64);

impl StateWord {
    fn pack(generation: u64, state: EngineState) -> u64 {
        (generation << STATE_BITS) | state.to_bits()
    }

    fn load(&self) -> (u64, EngineState) {
        let word = self.0.load(Ordering::Acquire);
        (word >> STATE_BITS, EngineState::from_bits(word))
    }

    fn set(&self, generation: u64, state: EngineState) {
        self.0.store(Self::pack(generation, state), Ordering::Release);
    }

    fn transition(&self, generation: u64, from: EngineState, to: EngineState) -> bool {
        self.0
            .compare_exchange(
                Self::pack(generation, from),
                Self::pack(generation, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

struct Session {
    generation: u64,
    frequency_hz: i32,
    stop: Arc<AtomicBool>,
    sink_release: Option<Arc<dyn SinkRelease>>,
    released: Receiver<()>,
    thread: JoinHandle<()>,
}

type OpenResult = std::result::Result<Option<Arc<dyn SinkRelease>>, SinkError>;

pub struct ToneEngine {
    factory: Arc<dyn SinkFactory>,
    config: Config,
    state: Arc<StateWord>,
    session: Mutex<Option<Session>>,
    device: Arc<Mutex<()>>,
    last_error: Arc<Mutex<Option<ToneError>>>,
    disposed: AtomicBool,
}

impl ToneEngine {
    /// `config.amplitude` is capped at [`AMPLITUDE`](crate::AMPLITUDE).
    pub fn new(factory: Arc<dyn SinkFactory>, mut config: Config) -> Self {
        config.amplitude = limit_amplitude(config.amplitude);
        Self {
            factory,
            config,
            state: Arc::new(StateWord::default()),
            session: Mutex::new(None),
            device: Arc::new(Mutex::new(())),
            last_error: Arc::new(Mutex::new(None)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Engine backed by the default cpal output device.
    pub fn with_cpal(config: Config) -> Self {
        Self::new(Arc::new(CpalSinkFactory::new()), config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a tone at `frequency_hz`, replacing any session already running.
    ///
    /// Returns once the sink is open and the synthesis thread is writing.
    /// Frequencies are not clamped; values at or above Nyquist alias.
    pub fn play(&self, frequency_hz: i32) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ToneError::EngineDisposed);
        }
        if frequency_hz <= 0 {
            return Err(ToneError::InvalidArgument(format!(
                "frequency must be positive, got {} Hz",
                frequency_hz
            )));
        }
        if self.config.sample_rate == 0 {
            return Err(ToneError::InvalidArgument(
                "sample rate must be positive".into(),
            ));
        }

        let mut slot = self.lock_session();
        // Re-checked under the lock so a concurrent release() wins.
        if self.disposed.load(Ordering::Acquire) {
            return Err(ToneError::EngineDisposed);
        }
        self.teardown(&mut slot);
        *lock(&self.last_error) = None;

        if aliases(frequency_hz, self.config.sample_rate) {
            warn!(
                "{} Hz is at or above Nyquist for {} Hz output and will alias",
                frequency_hz, self.config.sample_rate
            );
        }

        let (generation, _) = self.state.load();
        let generation = generation.wrapping_add(1);
        self.state.set(generation, EngineState::Starting);

        let stop = Arc::new(AtomicBool::new(false));
        let (opened_tx, opened_rx) = mpsc::sync_channel(0);
        let (released_tx, released_rx) = mpsc::sync_channel(1);

        let synth = SynthesisLoop {
            factory: Arc::clone(&self.factory),
            spec: StreamSpec::mono_pcm16(self.config.sample_rate),
            oscillator: Oscillator::new(
                frequency_hz,
                self.config.sample_rate,
                self.config.amplitude,
            ),
            state: Arc::clone(&self.state),
            generation,
            stop: Arc::clone(&stop),
            device: Arc::clone(&self.device),
            last_error: Arc::clone(&self.last_error),
        };

        let thread = thread::Builder::new()
            .name(format!("tone-synth-{}", generation))
            .spawn(move || synth.run(opened_tx, released_tx))
            .map_err(|e| {
                self.state.set(generation, EngineState::Idle);
                ToneError::Io(e)
            })?;

        match opened_rx.recv() {
            Ok(Ok(sink_release)) => {
                debug!("Session {} playing at {} Hz", generation, frequency_hz);
                *slot = Some(Session {
                    generation,
                    frequency_hz,
                    stop,
                    sink_release,
                    released: released_rx,
                    thread,
                });
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                self.state.set(generation, EngineState::Idle);
                Err(ToneError::DeviceUnavailable(err.to_string()))
            }
            Err(_) => {
                // The thread died before reporting; nothing was left open.
                let _ = thread.join();
                self.state.set(generation, EngineState::Idle);
                Err(ToneError::DeviceUnavailable(
                    "synthesis thread exited during start".into(),
                ))
            }
        }
    }

    /// Stops playback. Idempotent, never fails.
    pub fn stop(&self) {
        let mut slot = self.lock_session();
        self.teardown(&mut slot);
    }

    /// Snapshot of whether a session is currently producing audio.
    pub fn is_playing(&self) -> bool {
        self.state() == EngineState::Playing
    }

    pub fn state(&self) -> EngineState {
        self.state.load().1
    }

    /// Frequency of the running session, if one is still playing.
    pub fn frequency(&self) -> Option<i32> {
        if !self.is_playing() {
            return None;
        }
        self.lock_session().as_ref().map(|s| s.frequency_hz)
    }

    /// Stops playback and disposes the engine. Later `play` calls fail with
    /// [`ToneError::EngineDisposed`].
    pub fn release(&self) {
        let mut slot = self.lock_session();
        self.disposed.store(true, Ordering::Release);
        self.teardown(&mut slot);
        debug!("Tone engine released");
    }

    pub fn is_released(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Takes the error that ended the most recent session on its own,
    /// such as a [`ToneError::WriteFailure`] from the device.
    pub fn take_last_error(&self) -> Option<ToneError> {
        lock(&self.last_error).take()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        lock(&self.session)
    }

    fn teardown(&self, slot: &mut Option<Session>) {
        let Some(session) = slot.take() else {
            return;
        };

        let generation = session.generation;
        // The loop may already have gone idle after a write failure.
        self.state
            .transition(generation, EngineState::Playing, EngineState::Stopping);
        session.stop.store(true, Ordering::Release);

        match session.released.recv_timeout(self.config.stop_grace()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if session.thread.join().is_err() {
                    error!("Synthesis thread for session {} panicked", generation);
                }
                debug!("Session {} stopped", generation);
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Session {} did not release the sink within {:?}, releasing it and detaching",
                    generation,
                    self.config.stop_grace()
                );
                if let Some(sink_release) = &session.sink_release {
                    sink_release.release();
                }
            }
        }

        self.state.set(generation, EngineState::Idle);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for ToneEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the synthesis thread owns for one session.
struct SynthesisLoop {
    factory: Arc<dyn SinkFactory>,
    spec: StreamSpec,
    oscillator: Oscillator,
    state: Arc<StateWord>,
    generation: u64,
    stop: Arc<AtomicBool>,
    device: Arc<Mutex<()>>,
    last_error: Arc<Mutex<Option<ToneError>>>,
}

impl SynthesisLoop {
    fn run(mut self, opened: SyncSender<OpenResult>, released: SyncSender<()>) {
        // Held until the sink is dropped; a detached predecessor keeps us out.
        let device = Arc::clone(&self.device);
        let _lease = lock(&device);

        let block_bytes = self.factory.min_buffer_size(self.spec);
        let mut sink = match self.factory.open(self.spec) {
            Ok(sink) => sink,
            Err(err) => {
                error!("Could not open output sink: {}", err);
                let _ = opened.send(Err(err));
                return;
            }
        };

        self.state
            .transition(self.generation, EngineState::Starting, EngineState::Playing);
        if opened.send(Ok(sink.release_handle())).is_err() {
            sink.close();
            return;
        }

        let outcome = self.stream(sink.as_mut(), block_bytes);
        sink.close();
        drop(sink);

        match outcome {
            Err(err) if self.stop.load(Ordering::Acquire) => {
                debug!("Session {} write cut short by stop: {}", self.generation, err);
            }
            Err(err) => {
                error!("Session {} aborted: {}", self.generation, err);
                *lock(&self.last_error) = Some(ToneError::from(err));
                self.state
                    .transition(self.generation, EngineState::Playing, EngineState::Idle);
            }
            Ok(()) => {}
        }
        let _ = released.send(());
    }

    fn stream(
        &mut self,
        sink: &mut dyn AudioSink,
        block_bytes: usize,
    ) -> std::result::Result<(), SinkError> {
        let mut block = vec![0i16; (block_bytes / self.spec.bytes_per_frame()).max(1)];
        let mut bytes = Vec::with_capacity(block.len() * 2);

        while !self.stop.load(Ordering::Acquire) {
            self.oscillator.fill(&mut block);
            encode_block(&block, &mut bytes);

            if self.stop.load(Ordering::Acquire) {
                break;
            }
            sink.write(&bytes)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::peak_magnitude;
    use crate::sink::MemorySinkFactory;
    use crate::synth::peak_amplitude;
    use std::time::Duration;

    fn engine_with(factory: &MemorySinkFactory) -> ToneEngine {
        ToneEngine::new(Arc::new(factory.clone()), Config::default())
    }

    fn paced_factory() -> MemorySinkFactory {
        MemorySinkFactory::new(512).with_write_delay(Duration::from_millis(2))
    }

    #[test]
    fn test_state_word_packing() {
        let word = StateWord::default();
        assert_eq!(word.load(), (0, EngineState::Idle));

        word.set(7, EngineState::Playing);
        assert_eq!(word.load(), (7, EngineState::Playing));

        assert!(!word.transition(6, EngineState::Playing, EngineState::Idle));
        assert!(word.transition(7, EngineState::Playing, EngineState::Stopping));
        assert_eq!(word.load(), (7, EngineState::Stopping));
    }

    #[test]
    fn test_play_then_stop() {
        let factory = paced_factory();
        let engine = engine_with(&factory);

        engine.play(18000).unwrap();
        assert!(engine.is_playing());
        assert_eq!(engine.frequency(), Some(18000));

        engine.stop();
        assert!(!engine.is_playing());
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(factory.open_count(), 1);
        assert_eq!(factory.close_count(), 1);
        assert_eq!(engine.frequency(), None);
    }

    #[test]
    fn test_non_positive_frequency_rejected() {
        let factory = paced_factory();
        let engine = engine_with(&factory);

        assert!(matches!(engine.play(-5), Err(ToneError::InvalidArgument(_))));
        assert!(matches!(engine.play(0), Err(ToneError::InvalidArgument(_))));
        assert!(!engine.is_playing());
        assert_eq!(factory.open_count(), 0);
    }

    #[test]
    fn test_open_failure_leaves_engine_idle() {
        let factory = paced_factory();
        factory.fail_next_open("device busy");
        let engine = engine_with(&factory);

        assert!(matches!(
            engine.play(15000),
            Err(ToneError::DeviceUnavailable(_))
        ));
        assert!(!engine.is_playing());
        assert_eq!(engine.state(), EngineState::Idle);

        engine.play(15000).unwrap();
        assert!(engine.is_playing());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let factory = paced_factory();
        let engine = engine_with(&factory);

        engine.stop();
        engine.play(1000).unwrap();
        engine.stop();
        engine.stop();

        assert!(!engine.is_playing());
        assert_eq!(factory.close_count(), 1);
    }

    #[test]
    fn test_write_failure_drops_to_idle() {
        let factory = paced_factory();
        factory.fail_after_writes(3);
        let engine = engine_with(&factory);

        engine.play(12000).unwrap();
        for _ in 0..200 {
            if !engine.is_playing() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!engine.is_playing());
        assert_eq!(factory.close_count(), 1);
        assert!(matches!(
            engine.take_last_error(),
            Some(ToneError::WriteFailure(_))
        ));
        assert!(engine.take_last_error().is_none());

        engine.stop();
        assert_eq!(factory.sessions()[0].len(), 3 * 256);
    }

    #[test]
    fn test_stop_does_not_record_an_error() {
        let factory = paced_factory();
        let engine = engine_with(&factory);

        engine.play(7000).unwrap();
        engine.stop();
        assert!(engine.take_last_error().is_none());
    }

    #[test]
    fn test_amplitude_above_ceiling_is_capped() {
        let factory = paced_factory();
        let config = Config {
            amplitude: 1.5,
            ..Default::default()
        };
        let engine = ToneEngine::new(Arc::new(factory.clone()), config);
        assert_eq!(engine.config().amplitude, crate::AMPLITUDE);

        // A quarter turn per sample lands exactly on the peaks.
        engine.play(11025).unwrap();
        for _ in 0..200 {
            if factory.sample_count() >= 1024 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop();

        let ceiling = peak_amplitude(crate::AMPLITUDE) as i32;
        let samples = &factory.sessions()[0];
        assert!(!samples.is_empty());
        assert_eq!(peak_magnitude(samples), ceiling);
    }

    #[test]
    fn test_zero_sample_rate_rejected() {
        let factory = paced_factory();
        let config = Config {
            sample_rate: 0,
            ..Default::default()
        };
        let engine = ToneEngine::new(Arc::new(factory.clone()), config);

        assert!(matches!(engine.play(1000), Err(ToneError::InvalidArgument(_))));
        assert!(!engine.is_playing());
        assert_eq!(factory.open_count(), 0);
    }

    #[test]
    fn test_extreme_frequency_still_stops_promptly() {
        let factory = MemorySinkFactory::new(crate::DEFAULT_BLOCK_BYTES);
        let engine = engine_with(&factory);

        engine.play(i32::MAX).unwrap();
        thread::sleep(Duration::from_millis(20));
        engine.stop();

        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(factory.open_sinks(), 0);
        assert_eq!(factory.close_count(), 1);
    }

    #[test]
    fn test_released_engine_refuses_play() {
        let factory = paced_factory();
        let engine = engine_with(&factory);

        engine.play(20000).unwrap();
        engine.release();

        assert!(engine.is_released());
        assert!(!engine.is_playing());
        assert!(matches!(engine.play(20000), Err(ToneError::EngineDisposed)));
        assert_eq!(factory.open_sinks(), 0);
    }

    #[test]
    fn test_slow_sink_is_released_when_grace_expires() {
        let factory = MemorySinkFactory::new(512).with_write_delay(Duration::from_millis(300));
        let config = Config {
            stop_grace_ms: 20,
            ..Default::default()
        };
        let engine = ToneEngine::new(Arc::new(factory.clone()), config);

        engine.play(9000).unwrap();
        engine.stop();

        assert!(!engine.is_playing());
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(factory.open_sinks(), 0);
        assert_eq!(factory.close_count(), 1);
        // The write in flight was cut off, not delivered.
        assert!(factory.sessions()[0].is_empty());
    }

    #[test]
    fn test_replay_after_detached_session_keeps_single_writer() {
        let factory = MemorySinkFactory::new(512).with_write_delay(Duration::from_millis(300));
        let config = Config {
            stop_grace_ms: 20,
            ..Default::default()
        };
        let engine = ToneEngine::new(Arc::new(factory.clone()), config);

        engine.play(9000).unwrap();
        engine.stop();
        engine.play(10000).unwrap();

        assert!(engine.is_playing());
        assert_eq!(factory.open_count(), 2);
        assert_eq!(factory.open_sinks(), 1);
        assert!(!factory.single_writer_violated());

        engine.stop();
        assert_eq!(factory.open_sinks(), 0);
        assert!(!factory.single_writer_violated());
    }
}
