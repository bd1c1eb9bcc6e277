pub mod opus_codec;

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use opus_codec::{AudioDecoder, NullDecoder, OpusCodec, MAX_FRAME_SAMPLES};

pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

// Bounded packet queue between the WS reader and the playback worker;
// roughly four seconds of 60 ms frames.
const QUEUE_CAPACITY: usize = 64;

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

struct Worker {
    tx: SyncSender<Vec<u8>>,
    handle: JoinHandle<()>,
}

struct SinkInner {
    sample_rate: u32,
    worker: Option<Worker>,
    /// Set once device/codec setup has failed; packets are dropped quietly.
    silent: bool,
}

/// Opus playback sink. Packets flow through a bounded single-producer
/// single-consumer queue to a dedicated worker thread; rodio's
/// `OutputStream` is `!Send`, so the device is opened on that thread and
/// never crosses it.
///
/// Missing Opus or audio-output support degrades to a silent sink; the
/// engine keeps running and a warning is emitted once at startup.
pub struct AudioSink {
    inner: Mutex<SinkInner>,
}

impl AudioSink {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        let sink = Arc::new(Self {
            inner: Mutex::new(SinkInner {
                sample_rate,
                worker: None,
                silent: false,
            }),
        });
        let mut inner = sink.inner.lock().unwrap();
        match spawn_worker(sample_rate) {
            Ok(worker) => inner.worker = Some(worker),
            Err(e) => {
                warn!("audio playback unavailable, running silent: {}", e);
                inner.silent = true;
            }
        }
        drop(inner);
        sink
    }

    /// A sink that never opens an audio device. Used when audio is disabled
    /// by configuration and in headless tests.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SinkInner {
                sample_rate: DEFAULT_SAMPLE_RATE,
                worker: None,
                silent: true,
            }),
        })
    }

    /// Enqueues one Opus packet. A full queue drops the packet rather than
    /// blocking the network loop.
    pub fn push(&self, packet: Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        let Some(worker) = &inner.worker else {
            return;
        };
        match worker.tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("audio queue full, dropping packet");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("audio worker gone, dropping packet");
            }
        }
    }

    /// Rebuilds the decoder and playback stream at a new downstream rate.
    /// Packets still queued at the old rate are dropped with the worker.
    pub fn update_sample_rate(&self, sample_rate: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.sample_rate == sample_rate {
            return;
        }
        info!(
            "downstream sample rate {} -> {} Hz, rebuilding decoder",
            inner.sample_rate, sample_rate
        );
        inner.sample_rate = sample_rate;
        if inner.silent {
            return;
        }
        let was_running = inner.worker.is_some();
        stop_worker(&mut inner.worker);
        if was_running {
            match spawn_worker(sample_rate) {
                Ok(worker) => inner.worker = Some(worker),
                Err(e) => {
                    warn!("audio playback unavailable after rate change: {}", e);
                    inner.silent = true;
                }
            }
        }
    }

    /// Stops playback, drains the queue and releases the audio device.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        stop_worker(&mut inner.worker);
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().unwrap().sample_rate
    }

    pub fn is_silent(&self) -> bool {
        self.inner.lock().unwrap().silent
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn stop_worker(slot: &mut Option<Worker>) {
    if let Some(worker) = slot.take() {
        // Dropping the sender disconnects the queue; the worker exits on
        // the next dequeue.
        drop(worker.tx);
        let _ = worker.handle.join();
    }
}

fn spawn_worker(sample_rate: u32) -> crate::error::Result<Worker> {
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(QUEUE_CAPACITY);
    // Device and codec setup happen on the worker thread; this channel
    // carries the outcome back so startup failures surface here.
    let (ready_tx, ready_rx) = mpsc::channel::<crate::error::Result<()>>();

    let handle = std::thread::Builder::new()
        .name("audio-playback".to_string())
        .spawn(move || playback_loop(rx, sample_rate, ready_tx))
        .map_err(|e| crate::error::EngineError::Audio(format!("spawn failed: {}", e)))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Worker { tx, handle }),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(crate::error::EngineError::Audio(
                "audio worker died during setup".to_string(),
            ))
        }
    }
}

fn playback_loop(
    rx: mpsc::Receiver<Vec<u8>>,
    sample_rate: u32,
    ready_tx: mpsc::Sender<crate::error::Result<()>>,
) {
    let (_stream, stream_handle) = match rodio::OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(crate::error::EngineError::Audio(format!(
                "no audio output device: {}",
                e
            ))));
            return;
        }
    };
    let sink = match rodio::Sink::try_new(&stream_handle) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(crate::error::EngineError::Audio(format!(
                "failed to open playback sink: {}",
                e
            ))));
            return;
        }
    };

    // A failed decoder is not fatal: fall back to the null decoder so the
    // queue still drains.
    let mut decoder: Box<dyn AudioDecoder> = match OpusCodec::new(sample_rate) {
        Ok(d) => Box::new(d),
        Err(e) => {
            warn!("{}; playing silence", e);
            Box::new(NullDecoder)
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut pcm = vec![0i16; MAX_FRAME_SAMPLES];
    loop {
        match rx.recv_timeout(DEQUEUE_TIMEOUT) {
            Ok(packet) => match decoder.decode(&packet, &mut pcm) {
                Ok(0) => {}
                Ok(n) => {
                    let buffer =
                        rodio::buffer::SamplesBuffer::new(1, sample_rate, &pcm[..n]);
                    sink.append(buffer);
                }
                Err(e) => {
                    // Drop the bad packet and keep going.
                    warn!("{}", e);
                }
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    sink.stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_accepts_packets() {
        let sink = AudioSink::disabled();
        assert!(sink.is_silent());
        sink.push(vec![0xf8, 0xff, 0xfe]);
        sink.cleanup();
    }

    #[test]
    fn disabled_sink_tracks_rate_changes() {
        let sink = AudioSink::disabled();
        assert_eq!(sink.sample_rate(), DEFAULT_SAMPLE_RATE);
        sink.update_sample_rate(24000);
        assert_eq!(sink.sample_rate(), 24000);
        // Same rate again is a no-op.
        sink.update_sample_rate(24000);
        assert_eq!(sink.sample_rate(), 24000);
    }
}
