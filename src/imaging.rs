//! Image decoding and normalization.
//!
//! Every image the pipeline touches, whether served for prediction, drained
//! from the correction queue or read from the validation set, goes through
//! [`decode`] so training and inference see identically prepared inputs.

use crate::error::{FlowerError, Result};
use image::imageops::FilterType;

/// Side length images are resized to by default.
pub const IMAGE_RES: u32 = 224;

/// Content types accepted for uploads.
const JPEG_CONTENT_TYPES: [&str; 2] = ["image/jpeg", "image/jpg"];

/// Check an upload's declared content type.
pub fn is_jpeg_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    JPEG_CONTENT_TYPES.contains(&essence.as_str())
}

/// Reject anything that is not declared as JPEG.
pub fn ensure_jpeg(content_type: Option<&str>) -> Result<()> {
    match content_type {
        Some(ct) if is_jpeg_content_type(ct) => Ok(()),
        _ => Err(FlowerError::UnsupportedMediaType(
            "Only JPEG files are allowed".to_string(),
        )),
    }
}

/// A square RGB image scaled to `[0, 1]`, stored row-major as HWC.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    res: u32,
    data: Vec<f32>,
}

impl ImageTensor {
    /// Build a tensor from raw HWC data.
    pub fn from_raw(res: u32, data: Vec<f32>) -> Result<Self> {
        let expected = (res as usize) * (res as usize) * 3;
        if data.len() != expected {
            return Err(FlowerError::InvalidInput(format!(
                "tensor of {} values does not match {}x{}x3",
                data.len(),
                res,
                res
            )));
        }
        Ok(Self { res, data })
    }

    /// A tensor with every channel set to `value`.
    pub fn filled(res: u32, rgb: [f32; 3]) -> Self {
        let pixels = (res as usize) * (res as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self { res, data }
    }

    pub fn res(&self) -> u32 {
        self.res
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Value at row `y`, column `x`, channel `c`.
    #[inline]
    pub fn at(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[(y * self.res as usize + x) * 3 + c]
    }
}

/// Decode an encoded image, convert to RGB, resize to `res`×`res` and scale
/// to `[0, 1]`.
pub fn decode(bytes: &[u8], res: u32) -> Result<ImageTensor> {
    if bytes.is_empty() {
        return Err(FlowerError::ImageDecode("empty image".to_string()));
    }
    let decoded = image::load_from_memory(bytes)?;
    let rgb = decoded.to_rgb8();
    let resized = if rgb.width() == res && rgb.height() == res {
        rgb
    } else {
        image::imageops::resize(&rgb, res, res, FilterType::Triangle)
    };

    let data = resized
        .into_raw()
        .into_iter()
        .map(|v| f32::from(v) / 255.0)
        .collect();
    ImageTensor::from_raw(res, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode(img: RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_content_types() {
        assert!(is_jpeg_content_type("image/jpeg"));
        assert!(is_jpeg_content_type("image/jpg"));
        assert!(is_jpeg_content_type("Image/JPEG; charset=binary"));
        assert!(!is_jpeg_content_type("image/png"));
        assert!(ensure_jpeg(None).is_err());
        assert_eq!(
            ensure_jpeg(Some("text/plain")).unwrap_err().to_string(),
            "Only JPEG files are allowed"
        );
    }

    #[test]
    fn test_decode_resizes_and_normalizes() {
        let img = RgbImage::from_pixel(40, 30, Rgb([255, 0, 0]));
        let tensor = decode(&encode(img, ImageFormat::Png), 8).unwrap();

        assert_eq!(tensor.res(), 8);
        assert_eq!(tensor.data().len(), 8 * 8 * 3);
        assert!((tensor.at(3, 3, 0) - 1.0).abs() < 1e-6);
        assert!(tensor.at(3, 3, 1).abs() < 1e-6);
        assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_decode_jpeg() {
        let img = RgbImage::from_pixel(64, 64, Rgb([20, 200, 40]));
        let tensor = decode(&encode(img, ImageFormat::Jpeg), 16).unwrap();
        // JPEG is lossy; green should still dominate.
        assert!(tensor.at(8, 8, 1) > tensor.at(8, 8, 0));
        assert!(tensor.at(8, 8, 1) > tensor.at(8, 8, 2));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"", 8), Err(FlowerError::ImageDecode(_))));
        assert!(matches!(decode(b"definitely not an image", 8), Err(FlowerError::ImageDecode(_))));
    }

    #[test]
    fn test_from_raw_shape_check() {
        assert!(ImageTensor::from_raw(2, vec![0.0; 12]).is_ok());
        assert!(ImageTensor::from_raw(2, vec![0.0; 11]).is_err());
    }
}
