//! Output pixel formats and YUYV conversion routines

use serde::{Deserialize, Serialize};

use crate::capture::{FrameBuffer, FrameSize, PixelFormat};
use crate::error::ConvertError;

/// Fills `dst` from a packed YUYV source of the given geometry
pub type ConvertFn = fn(src: &[u8], size: FrameSize, dst: &mut [u8]);

/// Pixel format handed to the display sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Whatever the decode stage produced, untouched
    Raw,
    /// Packed YUYV, untouched
    Yuyv,
    Rgb565,
    #[default]
    Rgbx,
    /// Semi-planar Y + interleaved UV
    Nv12,
    /// Semi-planar Y + interleaved VU
    Nv21,
    /// Planar Y, U, V
    I420,
}

impl OutputFormat {
    /// Conversion routine for this format; `None` means pass-through.
    pub fn converter(self) -> Option<ConvertFn> {
        match self {
            OutputFormat::Raw | OutputFormat::Yuyv => None,
            OutputFormat::Rgb565 => Some(yuyv_to_rgb565),
            OutputFormat::Rgbx => Some(yuyv_to_rgbx),
            OutputFormat::Nv12 => Some(yuyv_to_nv12),
            OutputFormat::Nv21 => Some(yuyv_to_nv21),
            OutputFormat::I420 => Some(yuyv_to_i420),
        }
    }

    /// Pixel layout of buffers in this format
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            OutputFormat::Raw | OutputFormat::Yuyv => PixelFormat::Yuyv,
            OutputFormat::Rgb565 => PixelFormat::Rgb565,
            OutputFormat::Rgbx => PixelFormat::Rgbx,
            OutputFormat::Nv12 => PixelFormat::Nv12,
            OutputFormat::Nv21 => PixelFormat::Nv21,
            OutputFormat::I420 => PixelFormat::I420,
        }
    }

    /// Bytes of one output frame
    pub fn frame_bytes(self, size: FrameSize) -> usize {
        let pixels = size.pixels();
        match self {
            OutputFormat::Raw | OutputFormat::Yuyv | OutputFormat::Rgb565 => pixels * 2,
            OutputFormat::Rgbx => pixels * 4,
            OutputFormat::Nv12 | OutputFormat::Nv21 | OutputFormat::I420 => {
                pixels + chroma_len(size) * 2
            }
        }
    }
}

/// Samples per chroma plane for 4:2:0 output
fn chroma_len(size: FrameSize) -> usize {
    (size.width as usize / 2) * (size.height as usize).div_ceil(2)
}

/// Convert `src` into `dst` with the routine for `format`.
pub fn convert(
    src: &FrameBuffer,
    format: OutputFormat,
    dst: &mut FrameBuffer,
) -> Result<(), ConvertError> {
    let convert_fn = format.converter().ok_or(ConvertError::Unsupported {
        from: src.format,
        to: format,
    })?;
    if src.format != PixelFormat::Yuyv {
        return Err(ConvertError::Unsupported {
            from: src.format,
            to: format,
        });
    }

    let size = FrameSize::new(src.width, src.height);
    let expected = size.pixels() * 2;
    if src.len() < expected {
        return Err(ConvertError::ShortSource {
            expected,
            actual: src.len(),
        });
    }

    let out = dst.prepare_output(src, format.pixel_format(), format.frame_bytes(size));
    convert_fn(&src.as_slice()[..expected], size, out);
    Ok(())
}

#[inline]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 studio-swing YUV to RGB
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp((c + 409 * e + 128) >> 8),
        clamp((c - 100 * d - 208 * e + 128) >> 8),
        clamp((c + 516 * d + 128) >> 8),
    ]
}

fn for_each_pixel(src: &[u8], mut f: impl FnMut(usize, [u8; 3])) {
    for (pair, yuyv) in src.chunks_exact(4).enumerate() {
        let (y0, u, y1, v) = (yuyv[0], yuyv[1], yuyv[2], yuyv[3]);
        f(pair * 2, yuv_to_rgb(y0, u, v));
        f(pair * 2 + 1, yuv_to_rgb(y1, u, v));
    }
}

pub fn yuyv_to_rgbx(src: &[u8], _size: FrameSize, dst: &mut [u8]) {
    for_each_pixel(src, |i, [r, g, b]| {
        dst[i * 4..i * 4 + 4].copy_from_slice(&[r, g, b, 0xff]);
    });
}

pub fn yuyv_to_rgb565(src: &[u8], _size: FrameSize, dst: &mut [u8]) {
    for_each_pixel(src, |i, [r, g, b]| {
        let px = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
        dst[i * 2..i * 2 + 2].copy_from_slice(&px.to_le_bytes());
    });
}

/// Split YUYV into a luma plane and 4:2:0 chroma sampled from even rows.
fn yuyv_to_420(
    src: &[u8],
    size: FrameSize,
    dst: &mut [u8],
    mut put_chroma: impl FnMut(&mut [u8], usize, u8, u8),
) {
    let width = size.width as usize;
    let (luma, chroma) = dst.split_at_mut(size.pixels());
    for (row, line) in src.chunks_exact(width * 2).enumerate() {
        for (col, yuyv) in line.chunks_exact(4).enumerate() {
            luma[row * width + col * 2] = yuyv[0];
            luma[row * width + col * 2 + 1] = yuyv[2];
            if row % 2 == 0 {
                put_chroma(chroma, (row / 2) * (width / 2) + col, yuyv[1], yuyv[3]);
            }
        }
    }
}

pub fn yuyv_to_nv12(src: &[u8], size: FrameSize, dst: &mut [u8]) {
    yuyv_to_420(src, size, dst, |chroma, i, u, v| {
        chroma[i * 2] = u;
        chroma[i * 2 + 1] = v;
    });
}

pub fn yuyv_to_nv21(src: &[u8], size: FrameSize, dst: &mut [u8]) {
    yuyv_to_420(src, size, dst, |chroma, i, u, v| {
        chroma[i * 2] = v;
        chroma[i * 2 + 1] = u;
    });
}

pub fn yuyv_to_i420(src: &[u8], size: FrameSize, dst: &mut [u8]) {
    let plane = chroma_len(size);
    yuyv_to_420(src, size, dst, |chroma, i, u, v| {
        chroma[i] = u;
        chroma[plane + i] = v;
    });
}
