use image::{DynamicImage, GrayImage, ImageFormat};
use ndarray::Array2;
use std::io::Cursor;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Image dimensions {rows}x{columns} do not fit a raster")]
    Dimensions { rows: usize, columns: usize },
    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Linear min-max rescale into 0..=255, truncating toward zero.
///
/// A flat buffer (max == min) has no contrast to stretch and maps to all zeros.
pub fn rescale_to_u8(pixels: &Array2<f64>) -> Array2<u8> {
    let (min, max) = pixels
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;

    if !range.is_finite() || range <= 0.0 {
        return Array2::zeros(pixels.raw_dim());
    }

    pixels.mapv(|v| ((v - min) / range * 255.0) as u8)
}

pub fn encode_png(pixels: &Array2<u8>) -> Result<Vec<u8>, NormalizeError> {
    let (rows, columns) = pixels.dim();
    let dimensions_error = || NormalizeError::Dimensions { rows, columns };

    let width = u32::try_from(columns).map_err(|_| dimensions_error())?;
    let height = u32::try_from(rows).map_err(|_| dimensions_error())?;
    let raw: Vec<u8> = pixels.iter().copied().collect();
    let img = GrayImage::from_raw(width, height, raw).ok_or_else(dimensions_error)?;

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
