//! Image decoding and quality gate.
//!
//! Accepts raw encoded image bytes, plain Base64 text, or `data:image/...`
//! URIs, decodes to an owned pixel buffer, and measures sharpness as the
//! variance of a Laplacian edge filter over the grayscale plane.

use crate::config::QualityConfig;
use base64::Engine as _;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    Image(String),
    #[error("image dimensions {width}x{height} outside allowed range [{min}, {max}]")]
    BadDimensions {
        width: u32,
        height: u32,
        min: u32,
        max: u32,
    },
}

/// Decoded pixel grid owned by one pipeline invocation.
///
/// Holds the RGB plane and a derived grayscale plane; both are discarded when
/// the invocation returns.
#[derive(Clone)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB, `width * height * 3` bytes.
    pub rgb: Vec<u8>,
    /// Row-major grayscale, `width * height` bytes.
    pub gray: Vec<u8>,
}

impl ImageBuffer {
    /// Extract the grayscale sub-image for a region. The region must lie
    /// within bounds; it is clamped defensively at the edges.
    pub fn crop_gray(&self, x: u32, y: u32, width: u32, height: u32) -> Vec<u8> {
        let x1 = (x + width).min(self.width);
        let y1 = (y + height).min(self.height);
        let x0 = x.min(x1);
        let y0 = y.min(y1);

        let mut out = Vec::with_capacity(((x1 - x0) * (y1 - y0)) as usize);
        for row in y0..y1 {
            let start = (row * self.width + x0) as usize;
            let end = (row * self.width + x1) as usize;
            out.extend_from_slice(&self.gray[start..end]);
        }
        out
    }
}

/// Decode transport-encoded image bytes into an [`ImageBuffer`].
///
/// Tries the payload as raw encoded pixels first; if that fails and the
/// payload is text, treats it as Base64 (optionally wrapped in a data URI,
/// with missing `=` padding repaired) and retries.
pub fn decode(data: &[u8], cfg: &QualityConfig) -> Result<ImageBuffer, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    let dynamic = match image::load_from_memory(data) {
        Ok(img) => img,
        Err(raw_err) => {
            let Some(b64) = as_base64_payload(data) else {
                return Err(DecodeError::Image(raw_err.to_string()));
            };
            let bytes = base64::engine::general_purpose::STANDARD.decode(b64.as_bytes())?;
            image::load_from_memory(&bytes).map_err(|e| DecodeError::Image(e.to_string()))?
        }
    };

    let rgb_img = dynamic.to_rgb8();
    let (width, height) = (rgb_img.width(), rgb_img.height());
    if width < cfg.min_dimension
        || height < cfg.min_dimension
        || width > cfg.max_dimension
        || height > cfg.max_dimension
    {
        return Err(DecodeError::BadDimensions {
            width,
            height,
            min: cfg.min_dimension,
            max: cfg.max_dimension,
        });
    }

    let gray = dynamic.to_luma8().into_raw();
    Ok(ImageBuffer {
        width,
        height,
        rgb: rgb_img.into_raw(),
        gray,
    })
}

/// Interpret the payload as Base64 text if it plausibly is: strips a
/// `data:image/...;base64,` prefix, drops ASCII whitespace, and repairs
/// missing padding. Returns `None` for binary payloads.
fn as_base64_payload(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    let body = if text.starts_with("data:image") {
        text.split_once(',')?.1
    } else {
        text
    };

    let mut cleaned: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if cleaned.is_empty()
        || !cleaned
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
    {
        return None;
    }

    // Base64 length must be a multiple of 4
    let rem = cleaned.len() % 4;
    if rem > 0 {
        cleaned.extend(std::iter::repeat('=').take(4 - rem));
    }
    Some(cleaned)
}

/// Variance of the 4-neighbour Laplacian over a grayscale plane.
///
/// The blur metric: sharp natural texture produces a wide response
/// distribution, defocus and double-compression collapse it toward zero.
/// Computed over interior pixels with a signed response (no saturation).
pub fn laplacian_variance(gray: &[u8], width: u32, height: u32) -> f64 {
    let w = width as usize;
    let h = height as usize;
    if w < 3 || h < 3 || gray.len() < w * h {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray[y * w + x] as f64;
            let up = gray[(y - 1) * w + x] as f64;
            let down = gray[(y + 1) * w + x] as f64;
            let left = gray[y * w + x - 1] as f64;
            let right = gray[y * w + x + 1] as f64;

            let response = up + down + left + right - 4.0 * c;
            sum += response;
            sum_sq += response * response;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    sum_sq / count as f64 - mean * mean
}

/// Resize a grayscale plane with bilinear interpolation.
pub fn resize_gray(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
) -> Vec<u8> {
    let (sw, sh) = (src_w as usize, src_h as usize);
    let (dw, dh) = (dst_w as usize, dst_h as usize);
    if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
        return vec![0; dw * dh];
    }

    let scale_x = sw as f32 / dw as f32;
    let scale_y = sh as f32 / dh as f32;

    let mut out = vec![0u8; dw * dh];
    for y in 0..dh {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, sh as i32 - 1) as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dw {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, sw as i32 - 1) as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * sw + x0] as f32;
            let tr = src[y0 * sw + x1] as f32;
            let bl = src[y1 * sw + x0] as f32;
            let br = src[y1 * sw + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            out[y * dw + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer as ImgBuf, Rgb};

    fn encode_png(width: u32, height: u32, f: impl Fn(u32, u32) -> [u8; 3]) -> Vec<u8> {
        let img = ImgBuf::from_fn(width, height, |x, y| Rgb(f(x, y)));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_raw_png() {
        let png = encode_png(64, 48, |x, _| [x as u8, 0, 0]);
        let buf = decode(&png, &QualityConfig::default()).unwrap();
        assert_eq!(buf.width, 64);
        assert_eq!(buf.height, 48);
        assert_eq!(buf.rgb.len(), 64 * 48 * 3);
        assert_eq!(buf.gray.len(), 64 * 48);
    }

    #[test]
    fn test_decode_plain_base64() {
        let png = encode_png(40, 40, |_, _| [120, 130, 140]);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&png);
        let buf = decode(b64.as_bytes(), &QualityConfig::default()).unwrap();
        assert_eq!((buf.width, buf.height), (40, 40));
    }

    #[test]
    fn test_decode_data_uri_with_stripped_padding() {
        let png = encode_png(40, 40, |_, _| [10, 20, 30]);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&png);
        let uri = format!("data:image/png;base64,{}", b64.trim_end_matches('='));
        let buf = decode(uri.as_bytes(), &QualityConfig::default()).unwrap();
        assert_eq!((buf.width, buf.height), (40, 40));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode(b"\x00\x01definitely not an image\xff", &QualityConfig::default());
        assert!(matches!(err, Err(DecodeError::Image(_))));
    }

    #[test]
    fn test_decode_empty_fails() {
        assert!(matches!(
            decode(b"", &QualityConfig::default()),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn test_decode_rejects_undersized() {
        let png = encode_png(16, 16, |_, _| [128, 128, 128]);
        assert!(matches!(
            decode(&png, &QualityConfig::default()),
            Err(DecodeError::BadDimensions { .. })
        ));
    }

    #[test]
    fn test_laplacian_variance_uniform_is_zero() {
        let gray = vec![128u8; 50 * 50];
        assert!(laplacian_variance(&gray, 50, 50).abs() < 1e-9);
    }

    #[test]
    fn test_laplacian_variance_gradient_is_near_zero() {
        // A linear ramp has zero second derivative.
        let w = 60u32;
        let h = 60u32;
        let gray: Vec<u8> = (0..h)
            .flat_map(|_| (0..w).map(|x| (x * 4) as u8))
            .collect();
        assert!(laplacian_variance(&gray, w, h) < 1.0);
    }

    #[test]
    fn test_laplacian_variance_checkerboard_is_high() {
        let w = 50u32;
        let h = 50u32;
        let gray: Vec<u8> = (0..h)
            .flat_map(|y| (0..w).map(move |x| if (x + y) % 2 == 0 { 0 } else { 255 }))
            .collect();
        assert!(laplacian_variance(&gray, w, h) > 10_000.0);
    }

    #[test]
    fn test_crop_gray() {
        let buf = ImageBuffer {
            width: 4,
            height: 4,
            rgb: vec![0; 48],
            gray: (0..16).collect(),
        };
        let crop = buf.crop_gray(1, 1, 2, 2);
        assert_eq!(crop, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let src = vec![77u8; 30 * 30];
        let out = resize_gray(&src, 30, 30, 90, 45);
        assert!(out.iter().all(|&p| p == 77));
    }

    #[test]
    fn test_resize_output_size() {
        let src = vec![0u8; 100 * 80];
        assert_eq!(resize_gray(&src, 100, 80, 112, 112).len(), 112 * 112);
    }
}
