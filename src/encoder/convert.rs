//! Raw layout helpers
//!
//! Raw capture is strided RGBA bytes and interleaved f32 samples. Codecs get
//! tightly packed RGBA and their own sample encoding.

/// Copy an RGBA frame with `stride` bytes per row into `out` with the row
/// padding dropped. Pixel format and size conversion are left to the codec.
pub fn pack_rgba(src: &[u8], width: u32, height: u32, stride: usize, out: &mut Vec<u8>) {
    let row = width as usize * 4;
    out.clear();
    out.reserve(row * height as usize);
    for line in src.chunks(stride.max(row).max(1)).take(height as usize) {
        out.extend_from_slice(&line[..row.min(line.len())]);
    }
}

/// Sample encodings a codec may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32Le,
    S16Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32Le => 4,
            SampleFormat::S16Le => 2,
        }
    }

    /// Encode interleaved samples into `out`, replacing its contents
    pub fn encode(&self, samples: &[f32], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(samples.len() * self.bytes_per_sample());
        match self {
            SampleFormat::F32Le => {
                for s in samples {
                    out.extend_from_slice(&s.to_le_bytes());
                }
            }
            SampleFormat::S16Le => {
                for s in samples {
                    let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_drops_row_padding() {
        // 2x2 frame, 12-byte stride: 8 bytes of pixels then 4 bytes of padding
        let mut src = vec![0xEEu8; 2 * 12];
        src[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        src[12..20].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);
        let mut out = vec![0xAA; 3];
        pack_rgba(&src, 2, 2, 12, &mut out);
        assert_eq!(out, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_pack_tight_input_is_copied() {
        let src: Vec<u8> = (0..48).collect();
        let mut out = Vec::new();
        pack_rgba(&src, 4, 3, 16, &mut out);
        assert_eq!(out, src);
    }

    #[test]
    fn test_s16_clamps() {
        let mut out = Vec::new();
        SampleFormat::S16Le.encode(&[2.0, -2.0, 0.0], &mut out);
        assert_eq!(out, [0xFF, 0x7F, 0x01, 0x80, 0x00, 0x00]);
    }
}
