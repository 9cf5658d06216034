use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};
use thiserror::Error;

use super::frame::PixelFormat;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("jpeg decode failed: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("unsupported jpeg layout {0:?}")]
    JpegLayout(JpegPixelFormat),

    #[error("{format:?} buffer has {actual} bytes, expected {expected}")]
    Truncated {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported format: {0:?}")]
    Unsupported(PixelFormat),
}

/// Decode a raw device buffer into packed RGB24.
pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, DecodeError> {
    let pixels = width as usize * height as usize;
    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let decoded = decoder.decode()?;
            match decoder.info().map(|info| info.pixel_format) {
                Some(JpegPixelFormat::RGB24) | None => Ok(decoded),
                Some(JpegPixelFormat::L8) => Ok(decoded.iter().flat_map(|&l| [l, l, l]).collect()),
                Some(other) => Err(DecodeError::JpegLayout(other)),
            }
        }
        PixelFormat::Rgb24 => {
            // Already in RGB format
            check_len(format, data, pixels * 3)?;
            Ok(data[..pixels * 3].to_vec())
        }
        PixelFormat::Bgr24 => {
            check_len(format, data, pixels * 3)?;
            Ok(data[..pixels * 3]
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect())
        }
        PixelFormat::Yuyv4 => {
            check_len(format, data, pixels * 2)?;
            Ok(yuyv_to_rgb(&data[..pixels * 2]))
        }
        PixelFormat::Nv12 => Err(DecodeError::Unsupported(format)),
    }
}

fn check_len(format: PixelFormat, data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            format,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YUYV (YUY2) to RGB24.
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        out.extend_from_slice(&yuv_pixel(y0, u, v));
        out.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    out
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_black_and_white() {
        // Two pixels per macropixel: black then white, neutral chroma
        let rgb = decode_frame(&[16, 128, 235, 128], PixelFormat::Yuyv4, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn bgr_is_swizzled() {
        let rgb = decode_frame(&[1, 2, 3], PixelFormat::Bgr24, 1, 1).unwrap();
        assert_eq!(rgb, vec![3, 2, 1]);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = decode_frame(&[0; 5], PixelFormat::Rgb24, 2, 1).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { expected: 6, .. }));
    }

    #[test]
    fn garbage_jpeg_is_an_error() {
        assert!(decode_frame(&[0, 1, 2, 3], PixelFormat::Mjpeg, 2, 2).is_err());
    }
}
