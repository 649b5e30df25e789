//! Video sampling from the host's render target
//!
//! Runs on the render thread, once per captured tick, while the source image
//! is still valid. Rows are copied one at a time because the source and the
//! encoder's working buffer rarely share a stride.

use crate::encoder::Encoder;
use crate::utils::{RecorderError, Result};

const BYTES_PER_PIXEL: usize = 4;

/// Byte order of a 32-bit source pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgba,
    Bgra,
}

/// A borrowed view of one rendered image
#[derive(Debug, Clone, Copy)]
pub struct SourceImage<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes from the start of one row to the start of the next
    pub stride: usize,
    pub layout: PixelLayout,
}

impl<'a> SourceImage<'a> {
    /// Tightly packed RGBA image
    pub fn rgba(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize * BYTES_PER_PIXEL,
            layout: PixelLayout::Rgba,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_layout(mut self, layout: PixelLayout) -> Self {
        self.layout = layout;
        self
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    fn check(&self) -> Result<()> {
        let row = self.row_bytes();
        if self.stride < row {
            return Err(RecorderError::InvalidFrame(format!(
                "source stride {} is shorter than a {}-pixel row",
                self.stride, self.width
            )));
        }
        let needed = match self.height as usize {
            0 => 0,
            h => self.stride * (h - 1) + row,
        };
        if self.data.len() < needed {
            return Err(RecorderError::InvalidFrame(format!(
                "source image holds {} bytes, {}x{} needs {}",
                self.data.len(),
                self.width,
                self.height,
                needed
            )));
        }
        Ok(())
    }
}

/// Copies rendered images into the encoder's video working buffer
#[derive(Debug, Default)]
pub struct VideoSampler {
    frames_sampled: u64,
}

impl VideoSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `image` into a new video frame and submit it.
    ///
    /// Fails without touching the encoder if the image is malformed, and with
    /// `ResolutionMismatch` if it does not match the session resolution.
    pub fn sample(&mut self, image: &SourceImage<'_>, encoder: &mut Encoder) -> Result<()> {
        image.check()?;

        let mut frame = encoder.prepare_video(image.width, image.height)?;
        let dst_stride = frame.stride();
        let row = image.row_bytes();
        let dst = frame.buffer_mut();

        for y in 0..image.height as usize {
            let src_row = &image.data[y * image.stride..y * image.stride + row];
            let dst_row = &mut dst[y * dst_stride..y * dst_stride + row];
            copy_row(src_row, dst_row, image.layout);
        }

        frame.finish()?;
        self.frames_sampled += 1;
        Ok(())
    }

    pub fn frames_sampled(&self) -> u64 {
        self.frames_sampled
    }
}

fn copy_row(src: &[u8], dst: &mut [u8], layout: PixelLayout) {
    match layout {
        PixelLayout::Rgba => dst.copy_from_slice(src),
        PixelLayout::Bgra => {
            for (d, s) in dst
                .chunks_exact_mut(BYTES_PER_PIXEL)
                .zip(src.chunks_exact(BYTES_PER_PIXEL))
            {
                d[0] = s[2];
                d[1] = s[1];
                d[2] = s[0];
                d[3] = s[3];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::null::MemoryContainer;
    use crate::encoder::EncoderSettings;

    fn encoder(width: u32, height: u32) -> Encoder {
        let settings = EncoderSettings::for_tests(width, height, 30, 48_000, 2);
        let (container, _log) = MemoryContainer::new();
        Encoder::null(&settings, container).unwrap()
    }

    #[test]
    fn test_copies_rows_across_stride_mismatch() {
        // 3x2 source padded to a 16-byte stride
        let mut data = vec![0xEEu8; 16 * 2];
        for y in 0..2 {
            for x in 0..12 {
                data[y * 16 + x] = (y * 12 + x) as u8;
            }
        }
        let image = SourceImage::rgba(&data, 3, 2).with_stride(16);

        let mut enc = encoder(3, 2);
        let mut sampler = VideoSampler::new();
        sampler.sample(&image, &mut enc).unwrap();
        assert_eq!(sampler.frames_sampled(), 1);

        let raw = enc.last_video_frame().unwrap();
        assert_eq!(raw, (0..24u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_bgra_is_swizzled() {
        let data = [10u8, 20, 30, 40, 50, 60, 70, 80];
        let image = SourceImage::rgba(&data, 2, 1).with_layout(PixelLayout::Bgra);

        let mut enc = encoder(2, 1);
        VideoSampler::new().sample(&image, &mut enc).unwrap();
        assert_eq!(enc.last_video_frame().unwrap(), vec![30, 20, 10, 40, 70, 60, 50, 80]);
    }

    #[test]
    fn test_resolution_mismatch_costs_only_the_frame() {
        let data = vec![0u8; 4 * 4 * 4];
        let image = SourceImage::rgba(&data, 4, 4);

        let mut enc = encoder(8, 8);
        let mut sampler = VideoSampler::new();
        let err = sampler.sample(&image, &mut enc).unwrap_err();
        assert!(matches!(err, RecorderError::ResolutionMismatch { .. }));
        assert!(!err.is_fatal());
        assert_eq!(sampler.frames_sampled(), 0);

        let right = vec![0u8; 8 * 8 * 4];
        sampler.sample(&SourceImage::rgba(&right, 8, 8), &mut enc).unwrap();
        assert_eq!(enc.end().unwrap().video_frames, 1);
    }

    #[test]
    fn test_short_source_buffer_is_rejected() {
        let data = vec![0u8; 10];
        let image = SourceImage::rgba(&data, 4, 4);
        let mut enc = encoder(4, 4);
        assert!(VideoSampler::new().sample(&image, &mut enc).is_err());
        assert_eq!(enc.end().unwrap().video_frames, 0);
    }
}
