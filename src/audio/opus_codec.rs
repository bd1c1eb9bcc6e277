use opus::{Channels, Decoder};

use crate::error::{EngineError, Result};

// Max decoded frame: 120 ms at 48 kHz. The wire carries 60 ms mono frames,
// 960 samples at 16 kHz, but the buffer is sized for the codec limit.
pub const MAX_FRAME_SAMPLES: usize = 5760;

/// Decoding is an external capability: environments without Opus support
/// swap in [`NullDecoder`] and the engine keeps running silently.
pub trait AudioDecoder: Send {
    /// Decodes one packet into `out`, returning the number of samples
    /// written.
    fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> Result<usize>;
}

/// Stateful Opus decoder; one per playback worker, rebuilt on sample-rate
/// changes (packet-loss concealment state is per-rate).
pub struct OpusCodec {
    decoder: Decoder,
}

impl OpusCodec {
    pub fn new(sample_rate: u32) -> Result<Self> {
        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| EngineError::Audio(format!("failed to create Opus decoder: {}", e)))?;
        Ok(Self { decoder })
    }
}

impl AudioDecoder for OpusCodec {
    fn decode(&mut self, packet: &[u8], out: &mut [i16]) -> Result<usize> {
        self.decoder
            .decode(packet, out, false)
            .map_err(|e| EngineError::Audio(format!("Opus decode error: {}", e)))
    }
}

/// Decoder that produces no samples. Keeps the pipeline shape in audio-less
/// environments and in tests.
pub struct NullDecoder;

impl AudioDecoder for NullDecoder {
    fn decode(&mut self, _packet: &[u8], _out: &mut [i16]) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_decoder_yields_no_samples() {
        let mut dec = NullDecoder;
        let mut out = [0i16; MAX_FRAME_SAMPLES];
        assert_eq!(dec.decode(&[0xf8, 0xff, 0xfe], &mut out).unwrap(), 0);
    }
}
