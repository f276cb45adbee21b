pub mod decoder;
pub mod normalizer;

use decoder::DecodeError;
use normalizer::NormalizeError;

#[derive(Debug, thiserror::Error)]
pub enum ImagingError {
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    Normalize(#[from] NormalizeError),
}

/// DICOM file bytes to an 8-bit grayscale PNG.
pub fn dicom_to_png(bytes: &[u8]) -> Result<Vec<u8>, ImagingError> {
    let obj = decoder::read_dicom(bytes)?;
    let pixels = decoder::pixel_array(&obj)?;
    let scaled = normalizer::rescale_to_u8(&pixels);
    Ok(normalizer::encode_png(&scaled)?)
}
