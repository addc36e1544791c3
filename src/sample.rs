//! # Samples and Media
//!
//! A sample is one dataset item: an image (one frame) or a video sequence
//! (ordered frames) plus its ground-truth annotation. The pipeline reads samples
//! and never mutates them; reconstructions are fresh [`Media`] values.
//!
//! Frames are tightly packed RGB8. Every codec adapter consumes and produces
//! this layout, so the vision model always sees the same pixel format whatever
//! codec sits in front of it.

use std::io::Cursor;

use image::{ImageFormat, RgbImage};
use vcm_scale::cpu::rgb_len;
use vcm_scale::presets::Size;

use crate::error::{EvalError, EvalResult};

/// One RGB8 picture. Only constructed through checked constructors, so the
/// buffer length always matches a non-zero size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    size: Size,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a packed RGB8 buffer, checking its length against `size`.
    pub fn new(size: Size, data: Vec<u8>) -> EvalResult<Self> {
        if size.w == 0 || size.h == 0 {
            return Err(EvalError::dataset(None, "frame has zero width or height"));
        }
        if data.len() != rgb_len(size) {
            return Err(EvalError::dataset(
                None,
                format!(
                    "frame buffer is {} bytes, expected {} for {}x{}",
                    data.len(),
                    rgb_len(size),
                    size.w,
                    size.h
                ),
            ));
        }
        Ok(Self { size, data })
    }

    pub fn from_image(img: RgbImage) -> EvalResult<Self> {
        let size = Size {
            w: img.width(),
            h: img.height(),
        };
        Self::new(size, img.into_raw())
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Packed RGB8 bytes, row by row.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels(&self) -> u64 {
        self.size.pixels()
    }

    /// Lossless PNG encoding, used for conformance snapshots and inference requests.
    pub fn to_png(&self) -> EvalResult<Vec<u8>> {
        let img = RgbImage::from_raw(self.size.w, self.size.h, self.data.clone())
            .ok_or_else(|| EvalError::dataset(None, "frame buffer does not match its size"))?;
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

/// Ordered frames: one for images, N for video sequences.
pub type Media = Vec<Frame>;

/// Total pixel count over all frames of a media item.
pub fn media_pixels(media: &[Frame]) -> u64 {
    media.iter().map(Frame::pixels).sum()
}

/// Read-only reference to one dataset item.
#[derive(Debug, Clone)]
pub struct SampleHandle {
    /// Stable identity, part of every cache key
    pub id: String,
    /// Position in dataset iteration order
    pub index: usize,
    pub media: Media,
    /// Annotation in the evaluator's ground-truth shape
    pub ground_truth: serde_json::Value,
}

impl SampleHandle {
    pub fn pixels(&self) -> u64 {
        media_pixels(&self.media)
    }

    /// Size shared by all frames. Mixed-size sequences are rejected.
    pub fn frame_size(&self) -> EvalResult<Size> {
        let first = self
            .media
            .first()
            .ok_or_else(|| EvalError::dataset(None, format!("sample {} has no frames", self.id)))?;
        if self.media.iter().any(|f| f.size != first.size) {
            return Err(EvalError::dataset(
                None,
                format!("sample {} mixes frame sizes", self.id),
            ));
        }
        Ok(first.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(size: Size, value: u8) -> Frame {
        Frame::new(size, vec![value; rgb_len(size)]).unwrap()
    }

    #[test]
    fn frame_length_is_checked() {
        assert!(Frame::new(Size { w: 2, h: 2 }, vec![0; 11]).is_err());
        assert!(Frame::new(Size { w: 0, h: 2 }, vec![]).is_err());
        assert!(Frame::new(Size { w: 2, h: 2 }, vec![0; 12]).is_ok());
    }

    #[test]
    fn empty_images_are_rejected() {
        assert!(Frame::from_image(RgbImage::new(0, 4)).is_err());
        let frame = Frame::from_image(RgbImage::new(3, 2)).unwrap();
        assert_eq!(frame.size(), Size { w: 3, h: 2 });
        assert_eq!(frame.data().len(), 18);
    }

    #[test]
    fn png_round_trips_losslessly() {
        let frame = solid(Size { w: 5, h: 3 }, 77);
        let png = frame.to_png().unwrap();
        let back = image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(Frame::from_image(back).unwrap(), frame);
    }

    #[test]
    fn pixels_sum_over_frames() {
        let size = Size { w: 4, h: 2 };
        let sample = SampleHandle {
            id: "seq".into(),
            index: 0,
            media: vec![solid(size, 1), solid(size, 2), solid(size, 3)],
            ground_truth: serde_json::Value::Null,
        };
        assert_eq!(sample.pixels(), 24);
        assert_eq!(sample.frame_size().unwrap(), size);
    }

    #[test]
    fn mixed_sizes_are_rejected() {
        let sample = SampleHandle {
            id: "bad".into(),
            index: 0,
            media: vec![solid(Size { w: 2, h: 2 }, 0), solid(Size { w: 4, h: 2 }, 0)],
            ground_truth: serde_json::Value::Null,
        };
        assert!(sample.frame_size().is_err());
    }
}
