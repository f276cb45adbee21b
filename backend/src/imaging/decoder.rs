use dicom_core::value::PrimitiveValue;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_encoding::adapters::PixelDataReader;
use dicom_encoding::{Codec, TransferSyntaxIndex};
use dicom_object::DefaultDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use ndarray::Array2;

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8] = b"DICM";
const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Not a readable DICOM file: {0}")]
    Parse(String),
    #[error("Missing or invalid attribute: {0}")]
    MissingAttribute(&'static str),
    #[error("Unsupported pixel data: {0}")]
    Unsupported(String),
    #[error("Compressed pixel data could not be decoded: {0}")]
    Codec(String),
    #[error("Pixel data holds {actual} samples, expected at least {expected}")]
    Truncated { expected: usize, actual: usize },
    #[error("Image has no pixels")]
    Empty,
}

/// Accepts files with or without the 128 byte preamble.
pub fn read_dicom(bytes: &[u8]) -> Result<DefaultDicomObject, DecodeError> {
    let has_preamble = bytes.len() >= PREAMBLE_LEN + MAGIC.len()
        && &bytes[PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()] == MAGIC;
    let body = if has_preamble { &bytes[PREAMBLE_LEN..] } else { bytes };

    dicom_object::from_reader(body).map_err(|e| DecodeError::Parse(e.to_string()))
}

fn uint_attr(obj: &DefaultDicomObject, tag: Tag) -> Option<u32> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u32>().ok())
}

/// Where the meaningful bits sit inside each allocated sample.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SampleLayout {
    bits_allocated: u32,
    bits_stored: u32,
    shift: u32,
    signed: bool,
}

impl SampleLayout {
    /// BitsStored and HighBit fall back to a full-width sample when absent or inconsistent.
    fn new(bits_allocated: u32, bits_stored: Option<u32>, high_bit: Option<u32>, signed: bool) -> Self {
        let bits_stored = bits_stored
            .filter(|&bits| bits > 0 && bits <= bits_allocated)
            .unwrap_or(bits_allocated);
        let high_bit = high_bit
            .filter(|&bit| bit >= bits_stored - 1 && bit < bits_allocated)
            .unwrap_or(bits_stored - 1);

        Self {
            bits_allocated,
            bits_stored,
            shift: high_bit + 1 - bits_stored,
            signed,
        }
    }

    fn value(&self, raw: u32) -> f64 {
        let mask = (1_u64 << self.bits_stored) - 1;
        let stored = (u64::from(raw) >> self.shift) & mask;
        if self.signed && (stored >> (self.bits_stored - 1)) & 1 == 1 {
            (stored as i64 - (1_i64 << self.bits_stored)) as f64
        } else {
            stored as f64
        }
    }

    fn decode_bytes(&self, bytes: &[u8], big_endian: bool) -> Result<Vec<f64>, DecodeError> {
        let samples = match self.bits_allocated {
            8 => bytes.iter().map(|&b| self.value(u32::from(b))).collect(),
            16 => bytes
                .chunks_exact(2)
                .map(|c| {
                    let word = [c[0], c[1]];
                    let raw = if big_endian {
                        u16::from_be_bytes(word)
                    } else {
                        u16::from_le_bytes(word)
                    };
                    self.value(u32::from(raw))
                })
                .collect(),
            32 => bytes
                .chunks_exact(4)
                .map(|c| {
                    let word = [c[0], c[1], c[2], c[3]];
                    let raw = if big_endian {
                        u32::from_be_bytes(word)
                    } else {
                        u32::from_le_bytes(word)
                    };
                    self.value(raw)
                })
                .collect(),
            bits => {
                return Err(DecodeError::Unsupported(format!("{} bits allocated", bits)));
            }
        };
        Ok(samples)
    }
}

/// First frame of monochrome pixel data as a `rows x columns` buffer.
///
/// Native data is read directly. Encapsulated data goes through the codec
/// registered for the file's transfer syntax.
pub fn pixel_array(obj: &DefaultDicomObject) -> Result<Array2<f64>, DecodeError> {
    let rows = uint_attr(obj, tags::ROWS).ok_or(DecodeError::MissingAttribute("Rows"))? as usize;
    let columns =
        uint_attr(obj, tags::COLUMNS).ok_or(DecodeError::MissingAttribute("Columns"))? as usize;
    if rows == 0 || columns == 0 {
        return Err(DecodeError::Empty);
    }

    let samples_per_pixel = uint_attr(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1);
    if samples_per_pixel != 1 {
        return Err(DecodeError::Unsupported(format!(
            "{} samples per pixel",
            samples_per_pixel
        )));
    }

    let bits_allocated = uint_attr(obj, tags::BITS_ALLOCATED)
        .ok_or(DecodeError::MissingAttribute("BitsAllocated"))?;
    if !matches!(bits_allocated, 8 | 16 | 32 | 64) {
        return Err(DecodeError::Unsupported(format!(
            "{} bits allocated",
            bits_allocated
        )));
    }
    let layout = SampleLayout::new(
        bits_allocated,
        uint_attr(obj, tags::BITS_STORED),
        uint_attr(obj, tags::HIGH_BIT),
        uint_attr(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0) == 1,
    );

    let element = obj
        .element(tags::PIXEL_DATA)
        .map_err(|_| DecodeError::MissingAttribute("PixelData"))?;
    let mut samples = match element.value().primitive() {
        Some(primitive) => {
            let big_endian =
                obj.meta().transfer_syntax().trim_end_matches('\0') == EXPLICIT_VR_BIG_ENDIAN;
            native_samples(primitive, &layout, big_endian)?
        }
        None => layout.decode_bytes(&decode_first_frame(obj)?, false)?,
    };

    let expected = rows * columns;
    if samples.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: samples.len(),
        });
    }
    samples.truncate(expected);

    Array2::from_shape_vec((rows, columns), samples)
        .map_err(|e| DecodeError::Unsupported(e.to_string()))
}

fn native_samples(
    value: &PrimitiveValue,
    layout: &SampleLayout,
    big_endian: bool,
) -> Result<Vec<f64>, DecodeError> {
    let samples = match (value, layout.bits_allocated) {
        (PrimitiveValue::U8(bytes), _) => return layout.decode_bytes(bytes, big_endian),
        (PrimitiveValue::U16(words), 16) => {
            words.iter().map(|&v| layout.value(u32::from(v))).collect()
        }
        (PrimitiveValue::I16(words), 16) => {
            words.iter().map(|&v| layout.value(u32::from(v as u16))).collect()
        }
        (PrimitiveValue::U32(words), 32) => words.iter().map(|&v| layout.value(v)).collect(),
        (PrimitiveValue::I32(words), 32) => words.iter().map(|&v| layout.value(v as u32)).collect(),
        (PrimitiveValue::F32(words), _) => words.iter().map(|&v| v as f64).collect(),
        (PrimitiveValue::F64(words), _) => words.to_vec(),
        (_, bits) => {
            return Err(DecodeError::Unsupported(format!(
                "{} bits allocated with a mismatched value representation",
                bits
            )));
        }
    };
    Ok(samples)
}

/// Little endian samples of frame 0, decoded by the registered codec.
fn decode_first_frame(obj: &DefaultDicomObject) -> Result<Vec<u8>, DecodeError> {
    let uid = obj.meta().transfer_syntax().trim_end_matches('\0');
    let ts = TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| DecodeError::Unsupported(format!("unknown transfer syntax {}", uid)))?;

    let reader = match ts.codec() {
        Codec::EncapsulatedPixelData(Some(reader), _) => reader,
        _ => {
            return Err(DecodeError::Unsupported(format!(
                "no decoder for {} ({})",
                ts.name(),
                uid
            )));
        }
    };

    let mut frame = Vec::new();
    reader
        .decode_frame(obj, 0, &mut frame)
        .map_err(|e| DecodeError::Codec(e.to_string()))?;
    log::debug!("Decoded {} bytes of {} pixel data", frame.len(), ts.name());
    Ok(frame)
}
