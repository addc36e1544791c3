// SPDX-License-Identifier: MIT
//! # RGB8 ⇄ YUV 4:2:0 Planar Conversion
//!
//! Reference encoders read `.yuv` files: a full-resolution luma plane followed by
//! two quarter-resolution chroma planes, 8 bits per sample, frames concatenated.
//! Conversion uses the BT.601 limited-range integer approximation, so the same
//! RGB input always produces the same bytes on every platform.
//!
//! Chroma is the mean of each 2×2 RGB block before conversion. Odd widths and
//! heights are handled by repeating the last row/column.

use anyhow::{ensure, Result};

use crate::cpu::rgb_len;
use crate::presets::Size;

/// Dimensions of one chroma plane for a luma plane of `size`.
#[inline]
pub fn chroma_size(size: Size) -> Size {
    Size {
        w: size.w.div_ceil(2),
        h: size.h.div_ceil(2),
    }
}

/// Bytes in one YUV 4:2:0 frame.
#[inline]
pub fn yuv420p_frame_len(size: Size) -> usize {
    let c = chroma_size(size);
    size.pixels() as usize + 2 * c.pixels() as usize
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16)
}

#[inline]
fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp_u8(u), clamp_u8(v))
}

/// Convert one tightly packed RGB8 frame to planar YUV 4:2:0.
pub fn rgb_to_yuv420p(rgb: &[u8], size: Size) -> Result<Vec<u8>> {
    ensure!(
        rgb.len() == rgb_len(size),
        "rgb buffer is {} bytes, expected {} for {}x{}",
        rgb.len(),
        rgb_len(size),
        size.w,
        size.h
    );
    let (w, h) = (size.w as usize, size.h as usize);
    let c = chroma_size(size);
    let (cw, ch) = (c.w as usize, c.h as usize);

    let mut out = vec![0u8; yuv420p_frame_len(size)];
    let (y_plane, uv) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = uv.split_at_mut(cw * ch);

    let px = |x: usize, y: usize| -> (i32, i32, i32) {
        let i = (y * w + x) * 3;
        (rgb[i] as i32, rgb[i + 1] as i32, rgb[i + 2] as i32)
    };

    for y in 0..h {
        for x in 0..w {
            let (r, g, b) = px(x, y);
            y_plane[y * w + x] = luma(r, g, b);
        }
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let x0 = cx * 2;
            let y0 = cy * 2;
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);
            let mut acc = (0, 0, 0);
            for (x, y) in [(x0, y0), (x1, y0), (x0, y1), (x1, y1)] {
                let (r, g, b) = px(x, y);
                acc.0 += r;
                acc.1 += g;
                acc.2 += b;
            }
            let (u, v) = chroma((acc.0 + 2) / 4, (acc.1 + 2) / 4, (acc.2 + 2) / 4);
            u_plane[cy * cw + cx] = u;
            v_plane[cy * cw + cx] = v;
        }
    }
    Ok(out)
}

/// Convert one planar YUV 4:2:0 frame back to tightly packed RGB8.
pub fn yuv420p_to_rgb(yuv: &[u8], size: Size) -> Result<Vec<u8>> {
    ensure!(
        yuv.len() == yuv420p_frame_len(size),
        "yuv buffer is {} bytes, expected {} for {}x{}",
        yuv.len(),
        yuv420p_frame_len(size),
        size.w,
        size.h
    );
    let (w, h) = (size.w as usize, size.h as usize);
    let c = chroma_size(size);
    let cw = c.w as usize;
    let (y_plane, uv) = yuv.split_at(w * h);
    let (u_plane, v_plane) = uv.split_at(cw * c.h as usize);

    let mut out = vec![0u8; rgb_len(size)];
    for y in 0..h {
        for x in 0..w {
            let ci = (y / 2) * cw + x / 2;
            let c_ = y_plane[y * w + x] as i32 - 16;
            let d = u_plane[ci] as i32 - 128;
            let e = v_plane[ci] as i32 - 128;
            let i = (y * w + x) * 3;
            out[i] = clamp_u8((298 * c_ + 409 * e + 128) >> 8);
            out[i + 1] = clamp_u8((298 * c_ - 100 * d - 208 * e + 128) >> 8);
            out[i + 2] = clamp_u8((298 * c_ + 516 * d + 128) >> 8);
        }
    }
    Ok(out)
}

/// Split a concatenated multi-frame YUV file into per-frame RGB8 buffers.
pub fn yuv420p_sequence_to_rgb(yuv: &[u8], size: Size, frames: usize) -> Result<Vec<Vec<u8>>> {
    let frame_len = yuv420p_frame_len(size);
    ensure!(
        yuv.len() == frame_len * frames,
        "yuv sequence is {} bytes, expected {} frames of {} bytes",
        yuv.len(),
        frames,
        frame_len
    );
    yuv.chunks_exact(frame_len)
        .map(|chunk| yuv420p_to_rgb(chunk, size))
        .collect()
}
