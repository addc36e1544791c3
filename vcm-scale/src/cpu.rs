// SPDX-License-Identifier: MIT
// CPU scaler built on fast_image_resize (SIMD-accelerated).
// RGB8 in → RGB8 out, direct write into caller-provided dst buffer.

use anyhow::{Context, Result};
use fast_image_resize as fir;
use fir::images::{TypedImage, TypedImageRef};
use fir::pixels::U8x3;
use fir::{FilterType, ResizeAlg, ResizeOptions, Resizer};

use crate::presets::{ScalePlan, Size};

#[derive(Debug)]
pub enum ScaleError {
    BufferTooSmall { needed: usize, got: usize },
    SourceTooSmall { needed: usize, got: usize },
    Fir(fir::ResizeError),
    ImageBuf(fir::ImageBufferError),
}

impl From<fir::ResizeError> for ScaleError { fn from(e: fir::ResizeError) -> Self { Self::Fir(e) } }
impl From<fir::ImageBufferError> for ScaleError { fn from(e: fir::ImageBufferError) -> Self { Self::ImageBuf(e) } }

impl std::fmt::Display for ScaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleError::BufferTooSmall { needed, got } => write!(f, "Output buffer too small: need {} bytes, got {}", needed, got),
            ScaleError::SourceTooSmall { needed, got } => write!(f, "Source buffer too small: need {} bytes, got {}", needed, got),
            ScaleError::Fir(e) => write!(f, "Fast image resize error: {}", e),
            ScaleError::ImageBuf(e) => write!(f, "Image buffer error: {}", e),
        }
    }
}

impl std::error::Error for ScaleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScaleError::Fir(e) => Some(e),
            ScaleError::ImageBuf(e) => Some(e),
            _ => None,
        }
    }
}

/// Bytes needed for a tightly packed RGB8 picture.
#[inline]
pub fn rgb_len(size: Size) -> usize {
    size.w as usize * size.h as usize * 3
}

/// Main scaling entry point.
/// `src_rgb` must hold `plan.input` as tightly packed RGB8 rows.
/// `dst` must be at least `plan.out.w * plan.out.h * 3` bytes.
pub fn scale_rgb_cpu(
    resizer: &mut Resizer,
    src_rgb: &[u8],
    plan: &ScalePlan,
    dst: &mut [u8],
) -> Result<(), ScaleError> {
    let src_len = rgb_len(plan.input);
    if src_rgb.len() < src_len {
        return Err(ScaleError::SourceTooSmall { needed: src_len, got: src_rgb.len() });
    }
    let dst_len = rgb_len(plan.out);
    if dst.len() < dst_len {
        return Err(ScaleError::BufferTooSmall { needed: dst_len, got: dst.len() });
    }

    if plan.is_identity() {
        dst[..dst_len].copy_from_slice(&src_rgb[..src_len]);
        return Ok(());
    }

    let src_view = TypedImageRef::<U8x3>::from_buffer(plan.input.w, plan.input.h, &src_rgb[..src_len])?;
    let mut dst_image = TypedImage::<U8x3>::from_buffer(plan.out.w, plan.out.h, &mut dst[..dst_len])?;

    // Bilinear keeps the resample cheap and, more importantly, fixed: the raw
    // file handed to the encoder must not depend on anything but the plan.
    let opts = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
    resizer.resize_typed::<U8x3>(&src_view, &mut dst_image, &opts)?;
    Ok(())
}

/// Allocating convenience wrapper used by the codec adapters.
pub fn rescale_rgb(resizer: &mut Resizer, src_rgb: &[u8], plan: &ScalePlan) -> Result<Vec<u8>> {
    let mut out = vec![0u8; rgb_len(plan.out)];
    scale_rgb_cpu(resizer, src_rgb, plan, &mut out).with_context(|| {
        format!(
            "rescale {}x{} -> {}x{}",
            plan.input.w, plan.input.h, plan.out.w, plan.out.h
        )
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::{build_plan, ScaleTarget};

    fn gradient(size: Size) -> Vec<u8> {
        let mut data = Vec::with_capacity(rgb_len(size));
        for y in 0..size.h {
            for x in 0..size.w {
                data.extend_from_slice(&[(x * 4) as u8, (y * 4) as u8, 128]);
            }
        }
        data
    }

    #[test]
    fn identity_plan_copies() {
        let size = Size { w: 8, h: 6 };
        let src = gradient(size);
        let plan = build_plan(size, ScaleTarget::Identity, 2);
        let out = rescale_rgb(&mut Resizer::new(), &src, &plan).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn downscale_produces_planned_length() {
        let size = Size { w: 32, h: 16 };
        let plan = build_plan(size, ScaleTarget::Factor(0.5), 2);
        let out = rescale_rgb(&mut Resizer::new(), &gradient(size), &plan).unwrap();
        assert_eq!(out.len(), rgb_len(Size { w: 16, h: 8 }));
    }

    #[test]
    fn rescale_is_deterministic() {
        let size = Size { w: 30, h: 20 };
        let src = gradient(size);
        let plan = build_plan(size, ScaleTarget::Factor(0.75), 2);
        let a = rescale_rgb(&mut Resizer::new(), &src, &plan).unwrap();
        let b = rescale_rgb(&mut Resizer::new(), &src, &plan).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn short_source_is_rejected() {
        let plan = build_plan(Size { w: 4, h: 4 }, ScaleTarget::Factor(0.5), 2);
        let mut dst = vec![0u8; rgb_len(plan.out)];
        let err = scale_rgb_cpu(&mut Resizer::new(), &[0u8; 3], &plan, &mut dst).unwrap_err();
        assert!(matches!(err, ScaleError::SourceTooSmall { .. }));
    }
}
