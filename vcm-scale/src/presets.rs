// SPDX-License-Identifier: MIT
//! # Rescale Plan Computation
//!
//! Computes the coded resolution handed to a reference encoder. Codec tools that
//! consume 4:2:0 input need even dimensions, so every plan carries an alignment
//! and output sides are rounded to a multiple of it.
//!
//! ## Targets
//!
//! - **Identity**: keep the input size (still aligned)
//! - **Factor**: multiply both sides by a scale factor, the "scale" option of the
//!   external codec configuration
//! - **MaxLongSide**: clamp the longest side, never upscaling
//! - **Exact**: force the output size, aspect ratio is not preserved

/// Represents a 2D size with width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

impl Size {
    /// Number of pixels covered by this size.
    pub fn pixels(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

/// Defines the target size constraint for a rescale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScaleTarget {
    /// No resize beyond alignment.
    Identity,
    /// Multiply both sides by the factor (must be > 0).
    Factor(f64),
    /// Clamp the longest side to a maximum value, derive the other side proportionally.
    MaxLongSide(u32),
    /// Force output to exact dimensions.
    Exact(Size),
}

/// Complete rescale plan computed from input parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScalePlan {
    /// Original input dimensions
    pub input: Size,
    /// Target size constraint used for planning
    pub target: ScaleTarget,
    /// Final computed output dimensions
    pub out: Size,
}

impl ScalePlan {
    /// True when the plan leaves the picture untouched.
    pub fn is_identity(&self) -> bool {
        self.input == self.out
    }

    /// The plan that maps the coded picture back to the original resolution.
    pub fn inverse(&self) -> ScalePlan {
        ScalePlan {
            input: self.out,
            target: ScaleTarget::Exact(self.input),
            out: self.input,
        }
    }
}

/// Compute a rescale plan.
///
/// `align` rounds each output side to the nearest multiple (minimum one
/// multiple). Use 2 for 4:2:0 chroma subsampling and 1 to disable alignment.
/// An aligned size differs from the input only when the target asks for it or
/// the input itself is misaligned.
pub fn build_plan(input: Size, target: ScaleTarget, align: u32) -> ScalePlan {
    let align = align.max(1);
    let (w, h) = match target {
        ScaleTarget::Identity => (input.w, input.h),
        ScaleTarget::Factor(f) => scale_by(input, f),
        ScaleTarget::MaxLongSide(max_side) => fit_preserve(input, max_side),
        ScaleTarget::Exact(out) => (out.w, out.h),
    };
    ScalePlan {
        input,
        target,
        out: Size {
            w: align_to(w, align),
            h: align_to(h, align),
        },
    }
}

/// Multiply both sides by a factor; non-positive or non-finite factors are
/// treated as identity.
fn scale_by(input: Size, factor: f64) -> (u32, u32) {
    if !factor.is_finite() || factor <= 0.0 {
        return (input.w, input.h);
    }
    (
        ((input.w as f64 * factor).round() as u32).max(1),
        ((input.h as f64 * factor).round() as u32).max(1),
    )
}

/// Fit image within max_side constraint while preserving aspect ratio.
/// Never upscales.
fn fit_preserve(input: Size, max_long: u32) -> (u32, u32) {
    let (w, h) = (input.w as f64, input.h as f64);
    let long = w.max(h);
    let s = (max_long as f64 / long).min(1.0);
    (
        ((w * s).round() as u32).max(1),
        ((h * s).round() as u32).max(1),
    )
}

#[inline]
fn align_to(v: u32, align: u32) -> u32 {
    let rounded = ((v + align / 2) / align) * align;
    rounded.max(align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_halves_and_aligns() {
        let plan = build_plan(Size { w: 1920, h: 1080 }, ScaleTarget::Factor(0.5), 2);
        assert_eq!(plan.out, Size { w: 960, h: 540 });

        let odd = build_plan(Size { w: 101, h: 75 }, ScaleTarget::Factor(1.0), 2);
        assert_eq!(odd.out.w % 2, 0);
        assert_eq!(odd.out.h % 2, 0);
    }

    #[test]
    fn identity_plan_round_trips() {
        let plan = build_plan(Size { w: 64, h: 48 }, ScaleTarget::Identity, 2);
        assert!(plan.is_identity());
        assert_eq!(plan.inverse().out, plan.input);
    }

    #[test]
    fn max_long_side_never_upscales() {
        let plan = build_plan(Size { w: 320, h: 200 }, ScaleTarget::MaxLongSide(640), 1);
        assert_eq!(plan.out, Size { w: 320, h: 200 });

        let plan = build_plan(Size { w: 1280, h: 720 }, ScaleTarget::MaxLongSide(640), 1);
        assert_eq!(plan.out, Size { w: 640, h: 360 });
    }

    #[test]
    fn invalid_factor_is_identity() {
        let input = Size { w: 40, h: 30 };
        assert_eq!(build_plan(input, ScaleTarget::Factor(0.0), 1).out, input);
        assert_eq!(build_plan(input, ScaleTarget::Factor(f64::NAN), 1).out, input);
    }

    #[test]
    fn tiny_inputs_keep_one_alignment_unit() {
        let plan = build_plan(Size { w: 1, h: 1 }, ScaleTarget::Factor(0.25), 2);
        assert_eq!(plan.out, Size { w: 2, h: 2 });
    }
}
