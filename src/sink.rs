use crate::error::SinkError;
use crate::synth::decode_block;
use crate::{BIT_DEPTH, CHANNELS, SAMPLE_RATE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Stream format requested from a sink factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl StreamSpec {
    pub fn mono_pcm16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: CHANNELS,
            bit_depth: BIT_DEPTH,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self::mono_pcm16(SAMPLE_RATE)
    }
}

/// A streaming audio output opened for a single playback session.
pub trait AudioSink {
    /// Writes interleaved 16-bit little-endian PCM, blocking while the
    /// device buffer is full. Returns the number of bytes accepted.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError>;

    /// Stops and releases the device. Calling it more than once is harmless.
    fn close(&mut self);

    /// Handle that releases this sink from another thread, waking a
    /// blocked `write`. Sinks that cannot be released remotely return `None`.
    fn release_handle(&self) -> Option<Arc<dyn SinkRelease>> {
        None
    }
}

/// Releases a sink from outside the thread that writes to it.
///
/// After `release` returns the device is closed; any write in progress
/// or issued later fails instead of reaching the device.
pub trait SinkRelease: Send + Sync {
    fn release(&self);
}

/// Opens sinks. Shared with the synthesis thread, which performs the open.
pub trait SinkFactory: Send + Sync {
    fn open(&self, spec: StreamSpec) -> Result<Box<dyn AudioSink>, SinkError>;

    /// Recommended minimum block size in bytes for `spec`.
    fn min_buffer_size(&self, spec: StreamSpec) -> usize;
}

#[derive(Debug, Default)]
struct Recorder {
    sessions: Vec<Vec<i16>>,
    open_sinks: usize,
    writers_violated: bool,
    fail_next_open: Option<String>,
    fail_after_writes: Option<usize>,
}

/// In-memory sink factory.
///
/// Every opened sink records its samples into its own session buffer.
/// Two sinks open at the same time is recorded as a single-writer
/// violation instead of panicking, so it can be asserted from tests.
#[derive(Debug, Clone)]
pub struct MemorySinkFactory {
    recorder: Arc<Mutex<Recorder>>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    block_bytes: usize,
    write_delay: Option<Duration>,
}

impl MemorySinkFactory {
    pub fn new(block_bytes: usize) -> Self {
        Self {
            recorder: Arc::new(Mutex::new(Recorder::default())),
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            block_bytes,
            write_delay: None,
        }
    }

    /// Holds every write for `delay`, standing in for a device draining its buffer.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn fail_next_open(&self, reason: &str) {
        self.recorder().fail_next_open = Some(reason.to_string());
    }

    /// Makes the sink of the next session fail after `writes` successful writes.
    pub fn fail_after_writes(&self, writes: usize) {
        self.recorder().fail_after_writes = Some(writes);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn open_sinks(&self) -> usize {
        self.recorder().open_sinks
    }

    pub fn single_writer_violated(&self) -> bool {
        self.recorder().writers_violated
    }

    /// Total samples written across all sessions.
    pub fn sample_count(&self) -> usize {
        self.recorder().sessions.iter().map(Vec::len).sum()
    }

    /// Samples written in each session, in open order.
    pub fn sessions(&self) -> Vec<Vec<i16>> {
        self.recorder().sessions.clone()
    }

    fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, _spec: StreamSpec) -> Result<Box<dyn AudioSink>, SinkError> {
        let mut rec = self.recorder();
        if let Some(reason) = rec.fail_next_open.take() {
            return Err(SinkError::Open(reason));
        }

        rec.open_sinks += 1;
        if rec.open_sinks > 1 {
            rec.writers_violated = true;
        }
        rec.sessions.push(Vec::new());
        let session = rec.sessions.len() - 1;
        let fail_after = rec.fail_after_writes.take();
        drop(rec);

        self.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemorySink {
            lease: Arc::new(MemoryLease {
                factory: self.clone(),
                closed: Mutex::new(false),
                wake: Condvar::new(),
            }),
            session,
            writes: 0,
            fail_after,
        }))
    }

    fn min_buffer_size(&self, _spec: StreamSpec) -> usize {
        self.block_bytes
    }
}

/// Open/closed flag of one memory sink, shared with its release handle.
struct MemoryLease {
    factory: MemorySinkFactory,
    closed: Mutex<bool>,
    wake: Condvar,
}

impl MemoryLease {
    fn closed(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SinkRelease for MemoryLease {
    fn release(&self) {
        let mut closed = self.closed();
        if *closed {
            return;
        }
        *closed = true;
        self.factory.recorder().open_sinks -= 1;
        self.factory.closes.fetch_add(1, Ordering::SeqCst);
        drop(closed);
        self.wake.notify_all();
    }
}

struct MemorySink {
    lease: Arc<MemoryLease>,
    session: usize,
    writes: usize,
    fail_after: Option<usize>,
}

impl AudioSink for MemorySink {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        if self.fail_after.is_some_and(|n| self.writes >= n) {
            return Err(SinkError::Write("simulated device fault".into()));
        }

        let mut closed = self.lease.closed();
        if let Some(delay) = self.lease.factory.write_delay {
            // Stands in for the device draining; a release cuts it short.
            closed = self
                .lease
                .wake
                .wait_timeout_while(closed, delay, |closed| !*closed)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if *closed {
            return Err(SinkError::Write("sink already closed".into()));
        }

        // Recorded under the lease lock so a concurrent release cannot
        // slip in between the check and the write.
        let samples = decode_block(bytes);
        self.lease.factory.recorder().sessions[self.session].extend_from_slice(&samples);
        self.writes += 1;
        Ok(bytes.len())
    }

    fn close(&mut self) {
        self.lease.release();
    }

    fn release_handle(&self) -> Option<Arc<dyn SinkRelease>> {
        Some(self.lease.clone())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_sessions() {
        let factory = MemorySinkFactory::new(8);
        let mut sink = factory.open(StreamSpec::default()).unwrap();
        assert_eq!(sink.write(&[1, 0, 2, 0]).unwrap(), 4);
        sink.close();
        sink.close();

        assert_eq!(factory.sessions(), vec![vec![1, 2]]);
        assert_eq!(factory.open_count(), 1);
        assert_eq!(factory.close_count(), 1);
        assert!(sink.write(&[0, 0]).is_err());
    }

    #[test]
    fn test_overlapping_sinks_flag_violation() {
        let factory = MemorySinkFactory::new(8);
        let first = factory.open(StreamSpec::default()).unwrap();
        let _second = factory.open(StreamSpec::default()).unwrap();
        drop(first);
        assert!(factory.single_writer_violated());
        assert_eq!(factory.open_sinks(), 1);
    }

    #[test]
    fn test_scripted_failures() {
        let factory = MemorySinkFactory::new(8);
        factory.fail_next_open("busy");
        assert_eq!(
            factory.open(StreamSpec::default()).err(),
            Some(SinkError::Open("busy".into()))
        );

        factory.fail_after_writes(1);
        let mut sink = factory.open(StreamSpec::default()).unwrap();
        assert!(sink.write(&[0, 0]).is_ok());
        assert!(matches!(sink.write(&[0, 0]), Err(SinkError::Write(_))));
    }

    #[test]
    fn test_release_handle_wakes_blocked_write() {
        let factory = MemorySinkFactory::new(8).with_write_delay(Duration::from_secs(5));
        let mut sink = factory.open(StreamSpec::default()).unwrap();
        let handle = sink.release_handle().unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.release();
        });

        let started = std::time::Instant::now();
        assert!(matches!(sink.write(&[1, 0]), Err(SinkError::Write(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        releaser.join().unwrap();

        assert_eq!(factory.open_sinks(), 0);
        assert_eq!(factory.close_count(), 1);
        sink.close();
        assert_eq!(factory.close_count(), 1);
        assert_eq!(factory.sessions(), vec![Vec::<i16>::new()]);
    }

    #[test]
    fn test_stream_spec_frame_size() {
        assert_eq!(StreamSpec::default().bytes_per_frame(), 2);
    }
}
