//! Codec adapter: format classification and variant derivation.
//!
//! Classification is decided up front from the declared MIME type and the
//! filename extension so that camera-native formats take the fallback path
//! without a decode attempt, while a corrupt JPEG still surfaces as a decode
//! failure.

use crate::{
    models::{
        upload::UploadRequest,
        variant::{OutputEncoding, VariantSpec},
    },
    services::orientation,
};
use bytes::Bytes;
use image::{
    DynamicImage, GenericImageView, ImageReader, Limits, Rgb, RgbImage, Rgba,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
    imageops::FilterType,
};
use std::io::Cursor;
use thiserror::Error;

/// Largest source edge accepted by the decoder.
pub const MAX_SOURCE_DIMENSION: u32 = 16_384;

/// Largest edge libwebp can encode.
const MAX_WEBP_DIMENSION: u32 = 16_383;

const CAMERA_NATIVE_TYPES: [&str; 15] = [
    "image/heic",
    "image/heif",
    "image/heic-sequence",
    "image/heif-sequence",
    "image/avif",
    "image/dng",
    "image/x-adobe-dng",
    "image/x-canon-cr2",
    "image/x-canon-cr3",
    "image/x-nikon-nef",
    "image/x-sony-arw",
    "image/x-olympus-orf",
    "image/x-panasonic-rw2",
    "image/x-fuji-raf",
    "image/x-raw",
];

const CAMERA_NATIVE_EXTENSIONS: [&str; 13] = [
    "heic", "heif", "hif", "avif", "dng", "cr2", "cr3", "nef", "arw", "orf", "rw2", "raf", "raw",
];

const DECODABLE_TYPES: [&str; 10] = [
    "image/jpeg",
    "image/jpg",
    "image/pjpeg",
    "image/png",
    "image/webp",
    "image/gif",
    "image/bmp",
    "image/x-ms-bmp",
    "image/tiff",
    "image/x-png",
];

const DECODABLE_EXTENSIONS: [&str; 9] = [
    "jpg", "jpeg", "jpe", "png", "webp", "gif", "bmp", "tif", "tiff",
];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("format `{0}` cannot be decoded here")]
    UnsupportedFormat(String),
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("failed to encode {encoding:?} variant: {reason}")]
    Encode {
        encoding: OutputEncoding,
        reason: String,
    },
}

/// Ex-ante classification of an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormatSupport {
    Decodable,
    /// Carries the MIME type or extension that triggered the decision.
    Unsupported(String),
}

/// Re-encoded bytes for one variant.
#[derive(Clone, Debug)]
pub struct DerivedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub encoding: OutputEncoding,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageCodec {
    max_source_dimension: u32,
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self {
            max_source_dimension: MAX_SOURCE_DIMENSION,
        }
    }
}

impl ImageCodec {
    /// Decide whether the codec can read this upload, without decoding it.
    ///
    /// A camera-native MIME type or extension wins over anything else; a file
    /// named `IMG_0001.HEIC` sent as `image/jpeg` is still unsupported.
    pub fn classify(&self, content_type: &str, filename: &str) -> FormatSupport {
        let mime = normalize_mime(content_type);
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase());

        if CAMERA_NATIVE_TYPES.contains(&mime.as_str()) {
            return FormatSupport::Unsupported(mime);
        }
        if let Some(ext) = extension.as_deref() {
            if CAMERA_NATIVE_EXTENSIONS.contains(&ext) {
                return FormatSupport::Unsupported(format!(".{ext}"));
            }
        }

        if DECODABLE_TYPES.contains(&mime.as_str()) {
            return FormatSupport::Decodable;
        }
        if let Some(ext) = extension.as_deref() {
            if DECODABLE_EXTENSIONS.contains(&ext) {
                return FormatSupport::Decodable;
            }
        }

        FormatSupport::Unsupported(mime)
    }

    /// Decode, orient, resize and re-encode one variant.
    ///
    /// CPU bound; run it on the blocking pool from async code.
    pub fn derive(
        &self,
        upload: &UploadRequest,
        spec: &VariantSpec,
    ) -> Result<DerivedImage, CodecError> {
        let img = self.prepare(upload)?;
        render(&img, spec)
    }

    /// Like `derive` for several specs, decoding the input only once.
    pub fn derive_many(
        &self,
        upload: &UploadRequest,
        specs: &[VariantSpec],
    ) -> Result<Vec<DerivedImage>, CodecError> {
        let img = self.prepare(upload)?;
        specs.iter().map(|spec| render(&img, spec)).collect()
    }

    /// Refuse unsupported formats, then decode and apply EXIF orientation.
    fn prepare(&self, upload: &UploadRequest) -> Result<DynamicImage, CodecError> {
        if let FormatSupport::Unsupported(format) =
            self.classify(&upload.content_type, &upload.filename)
        {
            return Err(CodecError::UnsupportedFormat(format));
        }

        let img = self.decode(&upload.data)?;
        Ok(orientation::apply_orientation(
            img,
            orientation::read_exif_orientation(&upload.data),
        ))
    }

    fn decode(&self, data: &[u8]) -> Result<DynamicImage, CodecError> {
        let mut reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|err| CodecError::Decode(err.to_string()))?;
        if reader.format().is_none() {
            return Err(CodecError::Decode("unrecognized image data".into()));
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_source_dimension);
        limits.max_image_height = Some(self.max_source_dimension);
        reader.limits(limits);

        reader
            .decode()
            .map_err(|err| CodecError::Decode(err.to_string()))
    }
}

/// Resize to fit a square bounding box keeping aspect ratio, then encode.
/// Never enlarges.
fn render(img: &DynamicImage, spec: &VariantSpec) -> Result<DerivedImage, CodecError> {
    let (width, height) = img.dimensions();
    let bound = match (spec.encoding, spec.max_dimension) {
        (OutputEncoding::Webp, max) => {
            Some(max.unwrap_or(MAX_WEBP_DIMENSION).min(MAX_WEBP_DIMENSION))
        }
        (_, max) => max,
    };
    let resized;
    let target = match bound {
        Some(max) if width.max(height) > max => {
            resized = img.resize(max, max, FilterType::CatmullRom);
            &resized
        }
        _ => img,
    };

    let (width, height) = target.dimensions();
    let data = encode(target, spec)?;
    tracing::debug!(
        role = %spec.role,
        width,
        height,
        bytes = data.len(),
        "derived variant"
    );

    Ok(DerivedImage {
        data,
        width,
        height,
        encoding: spec.encoding,
    })
}

fn encode(img: &DynamicImage, spec: &VariantSpec) -> Result<Bytes, CodecError> {
    let encode_error = |reason: String| CodecError::Encode {
        encoding: spec.encoding,
        reason,
    };
    let quality = spec.quality.clamp(1, 100);

    if spec.encoding == OutputEncoding::Webp {
        let rgba = img.to_rgba8();
        let webp_data = webp::Encoder::from_rgba(&rgba, rgba.width(), rgba.height())
            .encode_simple(false, f32::from(quality))
            .map_err(|err| encode_error(format!("{err:?}")))?;
        return Ok(Bytes::copy_from_slice(&webp_data));
    }

    let mut out = Vec::new();
    let result = match spec.encoding {
        OutputEncoding::Png => {
            DynamicImage::ImageRgba8(img.to_rgba8()).write_with_encoder(PngEncoder::new(&mut out))
        }
        _ => {
            let rgb = if img.color().has_alpha() {
                flatten_onto_white(img)
            } else {
                img.to_rgb8()
            };
            DynamicImage::ImageRgb8(rgb)
                .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))
        }
    };

    result.map_err(|err| encode_error(err.to_string()))?;
    Ok(Bytes::from(out))
}

/// Composite over an opaque white background.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Lower-cased MIME type without parameters.
fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
