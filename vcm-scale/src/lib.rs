// SPDX-License-Identifier: MIT
//! # vcm-scale: Raw Pixel Preparation for Reference Codec Binaries
//!
//! Reference video encoders read raw planar files at a fixed resolution and
//! pixel layout. This crate holds the pixel-level steps that sit on either side
//! of such a subprocess: planning a rescale, running it, and converting between
//! packed RGB8 and planar YUV 4:2:0.
//!
//! ## Key Components
//!
//! - [`presets`]: Rescale plan computation (factor, longest side, exact size)
//! - [`cpu`]: RGB8 resize built on `fast_image_resize`
//! - [`yuv`]: BT.601 RGB8 ⇄ YUV 4:2:0 planar conversion
//!
//! ## Determinism
//!
//! Every function here is a pure function of its inputs. Codec evaluation relies
//! on that: two encodes of the same sample at the same operating point must feed
//! the encoder byte-identical raw files, otherwise cached bitstreams would not be
//! interchangeable with fresh ones.
//!
//! ## Usage Example
//!
//! ```rust
//! use vcm_scale::presets::{build_plan, ScaleTarget, Size};
//! use vcm_scale::yuv::{rgb_to_yuv420p, yuv420p_to_rgb};
//!
//! let input = Size { w: 64, h: 48 };
//! let plan = build_plan(input, ScaleTarget::Factor(0.5), 2);
//! assert_eq!((plan.out.w, plan.out.h), (32, 24));
//!
//! let rgb = vec![128u8; (input.w * input.h * 3) as usize];
//! let yuv = rgb_to_yuv420p(&rgb, input).unwrap();
//! let back = yuv420p_to_rgb(&yuv, input).unwrap();
//! assert_eq!(back.len(), rgb.len());
//! ```

pub mod cpu;
pub mod presets;
pub mod yuv;
