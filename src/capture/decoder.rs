use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use crate::capture::frame::{FrameBuffer, FrameSize, PixelFormat};
use crate::error::ConvertError;

/// Decoded size of a compressed frame: packed YUYV, 2 bytes per pixel
pub fn decoded_bytes(size: FrameSize) -> usize {
    size.pixels() * 2
}

/// Decode an MJPEG frame into packed YUYV so the rest of the pipeline only
/// ever sees raw frames.
pub fn mjpeg_to_yuyv(
    src: &FrameBuffer,
    expected: FrameSize,
    dst: &mut FrameBuffer,
) -> Result<(), ConvertError> {
    let mut decoder = Decoder::new(src.as_slice());
    // headers only; the frame size must be known before anything is allocated
    decoder.read_info()?;
    let info = decoder
        .info()
        .ok_or_else(|| ConvertError::JpegLayout("missing image info".into()))?;

    let actual = FrameSize::new(info.width as u32, info.height as u32);
    if actual != expected {
        return Err(ConvertError::GeometryMismatch { expected, actual });
    }

    // RGB24 output is 3 bytes per pixel, anything larger is a broken stream
    decoder.set_max_decoding_buffer_size(expected.pixels() * 3);
    let pixels = decoder.decode()?;

    let stride = match info.pixel_format {
        JpegPixelFormat::RGB24 => 3,
        JpegPixelFormat::L8 => 1,
        other => return Err(ConvertError::JpegLayout(format!("{other:?}"))),
    };

    let out = dst.prepare_output(src, PixelFormat::Yuyv, decoded_bytes(expected));
    for (rgb_pair, yuyv) in pixels.chunks_exact(stride * 2).zip(out.chunks_exact_mut(4)) {
        let (p0, p1) = rgb_pair.split_at(stride);
        let (y0, u0, v0) = rgb_to_yuv(rgb(p0));
        let (y1, u1, v1) = rgb_to_yuv(rgb(p1));
        yuyv[0] = y0;
        yuyv[1] = ((u0 as u16 + u1 as u16) / 2) as u8;
        yuyv[2] = y1;
        yuyv[3] = ((v0 as u16 + v1 as u16) / 2) as u8;
    }
    Ok(())
}

#[inline]
fn rgb(px: &[u8]) -> [i32; 3] {
    match px {
        [r, g, b] => [*r as i32, *g as i32, *b as i32],
        [l, ..] => [*l as i32; 3],
        [] => [0; 3],
    }
}

/// BT.601 studio-swing RGB to YUV
#[inline]
fn rgb_to_yuv([r, g, b]: [i32; 3]) -> (u8, u8, u8) {
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (y.clamp(0, 255) as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, RgbImage};

    use super::*;
    use crate::capture::DeviceFrame;
    use crate::pipeline::FramePool;

    fn jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb(color));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn mjpeg_frame(pool: &FramePool, size: FrameSize, data: &[u8]) -> FrameBuffer {
        let mut buf = pool.acquire(data.len());
        buf.copy_from(&DeviceFrame {
            sequence: 9,
            width: size.width,
            height: size.height,
            format: PixelFormat::Mjpeg,
            data,
            actual_length: data.len(),
        });
        buf
    }

    #[test]
    fn test_decode_white_frame() {
        let pool = FramePool::new(4);
        let size = FrameSize::new(16, 16);
        let src = mjpeg_frame(&pool, size, &jpeg(16, 16, [255, 255, 255]));
        let mut dst = pool.acquire(decoded_bytes(size));

        mjpeg_to_yuyv(&src, size, &mut dst).unwrap();
        assert_eq!(dst.format, PixelFormat::Yuyv);
        assert_eq!(dst.len(), 16 * 16 * 2);
        assert_eq!(dst.sequence, 9);
        for yuyv in dst.as_slice().chunks_exact(4) {
            assert!(yuyv[0] >= 230, "luma {}", yuyv[0]);
            assert!((yuyv[1] as i32 - 128).abs() <= 4);
            assert!((yuyv[3] as i32 - 128).abs() <= 4);
        }
    }

    #[test]
    fn test_geometry_mismatch() {
        let pool = FramePool::new(4);
        let src = mjpeg_frame(&pool, FrameSize::new(16, 8), &jpeg(16, 8, [0, 0, 0]));
        let mut dst = pool.acquire(0);
        assert!(matches!(
            mjpeg_to_yuyv(&src, FrameSize::new(32, 8), &mut dst),
            Err(ConvertError::GeometryMismatch { .. })
        ));
    }

    /// Rewrite the frame size in the SOF0 header of a baseline JPEG.
    fn patch_sof0(data: &mut [u8], width: u16, height: u16) {
        let sof = data
            .windows(2)
            .position(|w| w == [0xff, 0xc0])
            .expect("baseline JPEG");
        // marker, length(2), precision(1), height(2), width(2)
        data[sof + 5..sof + 7].copy_from_slice(&height.to_be_bytes());
        data[sof + 7..sof + 9].copy_from_slice(&width.to_be_bytes());
    }

    #[test]
    fn test_oversized_header_rejected_before_decode() {
        let pool = FramePool::new(4);
        let size = FrameSize::new(16, 16);
        let mut data = jpeg(16, 16, [10, 200, 30]);
        patch_sof0(&mut data, 32767, 32767);
        let src = mjpeg_frame(&pool, size, &data);
        let mut dst = pool.acquire(decoded_bytes(size));

        match mjpeg_to_yuyv(&src, size, &mut dst) {
            Err(ConvertError::GeometryMismatch { expected, actual }) => {
                assert_eq!(expected, size);
                assert_eq!(actual, FrameSize::new(32767, 32767));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(dst.is_empty());
    }

    #[test]
    fn test_garbage_is_an_error() {
        let pool = FramePool::new(4);
        let src = mjpeg_frame(&pool, FrameSize::new(2, 2), &[0xde, 0xad, 0xbe, 0xef]);
        let mut dst = pool.acquire(0);
        assert!(mjpeg_to_yuyv(&src, FrameSize::new(2, 2), &mut dst).is_err());
    }
}
