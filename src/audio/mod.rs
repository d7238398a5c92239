//! Audio pipeline: pull-based PCM sources, the per-guild mixer and the
//! guild-keyed session registry that ties queues, mixers and games together.

pub mod mixer;
pub mod queue;
pub mod registry;

use anyhow::Result;

/// Sample rate dictated by the Discord voice transport.
pub const SAMPLE_RATE: u32 = 48_000;
/// Interleaved stereo.
pub const CHANNELS: usize = 2;
/// One 20ms frame of interleaved stereo i16 samples (960 per channel).
pub const FRAME_SAMPLES: usize = 1920;

/// A pull-based source of interleaved 16-bit PCM at the transport format.
///
/// `next_chunk` returns at most [`FRAME_SAMPLES`] samples per call; a short
/// chunk (tail of a file) is fine, the mixer zero-pads it. `Ok(None)` signals
/// end-of-stream. Implementations run on the voice driver thread, so reads
/// must not block longer than a frame interval in the steady state.
pub trait PcmSource: Send {
    fn next_chunk(&mut self) -> Result<Option<Vec<i16>>>;

    /// Human-readable label for logs.
    fn label(&self) -> &str {
        "pcm"
    }
}

/// Saturating per-sample sum of `overlay` into `base`, growing `base` to the
/// longer of the two. Missing samples count as silence, so mixing is
/// commutative and order-independent.
pub fn mix_into(base: &mut Vec<i16>, overlay: &[i16]) {
    if overlay.len() > base.len() {
        base.resize(overlay.len(), 0);
    }
    for (dst, &src) in base.iter_mut().zip(overlay.iter()) {
        *dst = dst.saturating_add(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mix_is_commutative() {
        let a = vec![100i16, -200, 300, i16::MAX];
        let b = vec![50i16, -50, i16::MAX];

        let mut ab = a.clone();
        mix_into(&mut ab, &b);
        let mut ba = b.clone();
        mix_into(&mut ba, &a);

        assert_eq!(ab, ba);
    }

    #[test]
    fn mix_saturates() {
        let mut base = vec![i16::MAX, i16::MIN];
        mix_into(&mut base, &[1000, -1000]);
        assert_eq!(base, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn mix_zero_pads_shorter_buffer() {
        let mut base = vec![1i16, 2];
        mix_into(&mut base, &[10, 20, 30, 40]);
        assert_eq!(base, vec![11, 22, 30, 40]);
    }
}
