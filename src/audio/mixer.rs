//! The per-connection mixing source.
//!
//! One [`Mixer`] is attached to a songbird `Call` as its single playing
//! input. The voice driver pulls fixed-size frames through [`MixerReader`]
//! at playback cadence on its own thread; command handlers swap the main
//! track and layer transient effects from the tokio side. Everything the
//! driver touches lives behind one short `parking_lot` critical section.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use songbird::input::core::io::MediaSource;
use songbird::input::{Input, RawAdapter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{mix_into, PcmSource, CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};

/// Deferred end-of-track notification. Produced by command handlers, captured
/// by the mixer when the main source runs dry, and executed by the registry's
/// dispatcher task - never inline on the voice driver thread, since the
/// callback typically re-enters the mixer (queue progression).
pub type EndCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct MixerState {
    main: Option<Box<dyn PcmSource>>,
    effects: Vec<Box<dyn PcmSource>>,
    on_main_end: Option<EndCallback>,
}

/// Cloneable handle to one guild's mixer.
#[derive(Clone)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    end_tx: mpsc::UnboundedSender<EndCallback>,
}

impl Mixer {
    pub fn new(end_tx: mpsc::UnboundedSender<EndCallback>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                main: None,
                effects: Vec::new(),
                on_main_end: None,
            })),
            end_tx,
        }
    }

    /// Atomically replaces the main source. The old source (when present and
    /// distinct) is released after the swap; its pending `on_end` is discarded
    /// without firing - only exhaustion fires the callback, never replacement.
    pub fn set_main(&self, source: Option<Box<dyn PcmSource>>, on_end: Option<EndCallback>) {
        let (old_source, old_callback) = {
            let mut state = self.state.lock();
            let old_source = std::mem::replace(&mut state.main, source);
            let old_callback = std::mem::replace(&mut state.on_main_end, on_end);
            (old_source, old_callback)
        };
        // Drop outside the critical section: source cleanup may block.
        drop(old_callback);
        drop(old_source);
    }

    /// Layers a transient effect on top of whatever is playing. Effects never
    /// delay the main track; each is removed once it signals end-of-stream.
    pub fn add_effect(&self, source: Box<dyn PcmSource>) {
        self.state.lock().effects.push(source);
    }

    /// Drops every pending effect mid-stream, for alert cancellation.
    pub fn clear_effects(&self) {
        let dropped = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.effects)
        };
        drop(dropped);
    }

    pub fn has_main(&self) -> bool {
        self.state.lock().main.is_some()
    }

    pub fn has_effects(&self) -> bool {
        !self.state.lock().effects.is_empty()
    }

    /// One read-and-mix cycle. Always returns exactly [`FRAME_SAMPLES`]
    /// samples - a silence frame when nothing is playing, so the driver's
    /// cadence never stalls. Source read failures are logged and treated as
    /// end-of-stream; this function itself never fails.
    pub fn produce_frame(&self) -> Vec<i16> {
        let mut mixed: Vec<i16> = Vec::new();
        let mut ended: Vec<Box<dyn PcmSource>> = Vec::new();
        let mut end_callback: Option<EndCallback> = None;

        {
            let mut state = self.state.lock();

            let main_ended = match state.main.as_mut() {
                Some(main) => match main.next_chunk() {
                    Ok(Some(chunk)) if !chunk.is_empty() => {
                        mixed = chunk;
                        false
                    }
                    Ok(_) => true,
                    Err(e) => {
                        warn!("Main source '{}' read failed: {e:#}", main.label());
                        true
                    }
                },
                None => false,
            };
            if main_ended {
                if let Some(source) = state.main.take() {
                    ended.push(source);
                }
                end_callback = state.on_main_end.take();
            }

            let mut remaining = Vec::with_capacity(state.effects.len());
            for mut effect in state.effects.drain(..) {
                match effect.next_chunk() {
                    Ok(Some(chunk)) if !chunk.is_empty() => {
                        mix_into(&mut mixed, &chunk);
                        remaining.push(effect);
                    }
                    Ok(_) => ended.push(effect),
                    Err(e) => {
                        warn!("Effect source '{}' read failed: {e:#}", effect.label());
                        ended.push(effect);
                    }
                }
            }
            state.effects = remaining;
        }

        // Release exhausted sources and hand the end callback to the
        // cooperative scheduler, both outside the lock.
        drop(ended);
        if let Some(callback) = end_callback {
            if self.end_tx.send(callback).is_err() {
                debug!("End-callback dispatcher is gone, dropping notification");
            }
        }

        mixed.resize(FRAME_SAMPLES, 0);
        mixed
    }

    /// Wraps this mixer as a songbird input (raw f32 @ 48kHz stereo).
    pub fn into_input(self) -> Input {
        RawAdapter::new(MixerReader::new(self), SAMPLE_RATE, CHANNELS as u32).into()
    }
}

/// Byte-stream adapter pulled by the voice driver. Converts one mixed i16
/// frame at a time into little-endian f32 samples for [`RawAdapter`].
pub struct MixerReader {
    mixer: Mixer,
    buf: Vec<u8>,
    pos: usize,
}

impl MixerReader {
    fn new(mixer: Mixer) -> Self {
        Self {
            mixer,
            buf: Vec::with_capacity(FRAME_SAMPLES * 4),
            pos: 0,
        }
    }

    fn refill(&mut self) {
        let frame = self.mixer.produce_frame();
        self.buf.clear();
        for sample in frame {
            let value = f32::from(sample) / 32768.0;
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
        self.pos = 0;
    }
}

impl Read for MixerReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.buf.len() {
            self.refill();
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Seek for MixerReader {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "mixer stream is not seekable",
        ))
    }
}

impl MediaSource for MixerReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    struct FakeSource {
        chunks: VecDeque<Vec<i16>>,
    }

    impl FakeSource {
        fn new(chunks: Vec<Vec<i16>>) -> Box<Self> {
            Box::new(Self {
                chunks: chunks.into(),
            })
        }
    }

    impl PcmSource for FakeSource {
        fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<i16>>> {
            Ok(self.chunks.pop_front())
        }
    }

    struct BrokenSource;

    impl PcmSource for BrokenSource {
        fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<i16>>> {
            anyhow::bail!("decoder exploded")
        }
    }

    fn mixer() -> (Mixer, mpsc::UnboundedReceiver<EndCallback>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Mixer::new(tx), rx)
    }

    fn marker_callback(tx: std::sync::mpsc::Sender<()>) -> EndCallback {
        Box::new(move || {
            let _ = tx.send(());
            Box::pin(async {})
        })
    }

    #[test]
    fn idle_mixer_produces_silence_frames() {
        let (mixer, _rx) = mixer();
        for _ in 0..3 {
            let frame = mixer.produce_frame();
            assert_eq!(frame.len(), FRAME_SAMPLES);
            assert!(frame.iter().all(|&s| s == 0));
        }
    }

    #[test]
    fn every_frame_has_fixed_size() {
        let (mixer, _rx) = mixer();
        mixer.set_main(Some(FakeSource::new(vec![vec![5; 100], vec![7; FRAME_SAMPLES]])), None);
        mixer.add_effect(FakeSource::new(vec![vec![1; 40]]));

        for _ in 0..4 {
            assert_eq!(mixer.produce_frame().len(), FRAME_SAMPLES);
        }
    }

    #[test]
    fn main_and_effects_are_summed() {
        let (mixer, _rx) = mixer();
        mixer.set_main(Some(FakeSource::new(vec![vec![100; 4]])), None);
        mixer.add_effect(FakeSource::new(vec![vec![25; 8]]));

        let frame = mixer.produce_frame();
        assert_eq!(&frame[..4], &[125, 125, 125, 125]);
        assert_eq!(&frame[4..8], &[25, 25, 25, 25]);
        assert_eq!(frame[8], 0);
    }

    #[test]
    fn exhausted_effects_are_dropped() {
        let (mixer, _rx) = mixer();
        mixer.add_effect(FakeSource::new(vec![vec![1; 10]]));
        assert!(mixer.has_effects());

        mixer.produce_frame(); // last real chunk
        mixer.produce_frame(); // EOF observed, effect removed
        assert!(!mixer.has_effects());
    }

    #[test]
    fn on_end_fires_exactly_once_on_exhaustion() {
        let (mixer, mut rx) = mixer();
        let (marker_tx, marker_rx) = std::sync::mpsc::channel();

        mixer.set_main(
            Some(FakeSource::new(vec![vec![1; 10]])),
            Some(marker_callback(marker_tx)),
        );

        mixer.produce_frame();
        assert!(rx.try_recv().is_err(), "callback fired before exhaustion");

        mixer.produce_frame(); // EOF
        let callback = rx.try_recv().expect("callback queued on exhaustion");
        futures::executor::block_on(callback());
        assert!(marker_rx.try_recv().is_ok());

        // Further frames never re-fire it.
        mixer.produce_frame();
        assert!(rx.try_recv().is_err());
        assert!(!mixer.has_main());
    }

    #[test]
    fn replacing_main_does_not_fire_on_end() {
        let (mixer, mut rx) = mixer();
        let (marker_tx, _marker_rx) = std::sync::mpsc::channel();

        mixer.set_main(
            Some(FakeSource::new(vec![vec![1; 10]])),
            Some(marker_callback(marker_tx)),
        );
        mixer.set_main(None, None); // explicit skip
        mixer.produce_frame();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failing_main_counts_as_exhausted() {
        let (mixer, mut rx) = mixer();
        let (marker_tx, _marker_rx) = std::sync::mpsc::channel();

        mixer.set_main(Some(Box::new(BrokenSource)), Some(marker_callback(marker_tx)));
        let frame = mixer.produce_frame();

        assert_eq!(frame.len(), FRAME_SAMPLES);
        assert!(rx.try_recv().is_ok(), "failure must drive progression");
        assert!(!mixer.has_main());
    }

    #[test]
    fn clear_effects_interrupts_mid_stream() {
        let (mixer, _rx) = mixer();
        mixer.set_main(Some(FakeSource::new(vec![vec![9; 4], vec![9; 4]])), None);
        mixer.add_effect(FakeSource::new(vec![vec![1; 4], vec![1; 4], vec![1; 4]]));

        assert_eq!(&mixer.produce_frame()[..4], &[10, 10, 10, 10]);
        mixer.clear_effects();
        assert!(!mixer.has_effects());
        assert_eq!(&mixer.produce_frame()[..4], &[9, 9, 9, 9], "main keeps playing");
    }

    #[test]
    fn effect_order_does_not_matter() {
        let a = vec![30000i16; 8];
        let b = vec![5000i16; 4];

        let (m1, _rx1) = mixer();
        m1.add_effect(FakeSource::new(vec![a.clone()]));
        m1.add_effect(FakeSource::new(vec![b.clone()]));

        let (m2, _rx2) = mixer();
        m2.add_effect(FakeSource::new(vec![b]));
        m2.add_effect(FakeSource::new(vec![a]));

        assert_eq!(m1.produce_frame(), m2.produce_frame());
    }
}
