//! EXIF orientation correction.

use exif::{In, Reader, Tag};
use image::DynamicImage;
use std::io::Cursor;

/// Read the EXIF orientation tag (1–8). Returns 1 when absent or unreadable.
pub fn read_exif_orientation(data: &[u8]) -> u32 {
    let mut cursor = Cursor::new(data);
    let Ok(exif) = Reader::new().read_from_container(&mut cursor) else {
        return 1;
    };

    exif.get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .filter(|value| (1..=8).contains(value))
        .unwrap_or(1)
}

/// Returns (clockwise rotation, flip horizontal, flip vertical) undoing an
/// orientation. The rotation is applied first.
pub fn orientation_transforms(orientation: u32) -> (Option<u16>, bool, bool) {
    match orientation {
        2 => (None, true, false),
        3 => (Some(180), false, false),
        4 => (None, false, true),
        5 => (Some(90), true, false),
        6 => (Some(90), false, false),
        7 => (Some(270), true, false),
        8 => (Some(270), false, false),
        _ => (None, false, false),
    }
}

/// Apply the correction for `orientation` to a decoded image.
pub fn apply_orientation(mut img: DynamicImage, orientation: u32) -> DynamicImage {
    let (rotate, flip_h, flip_v) = orientation_transforms(orientation);
    if orientation != 1 {
        tracing::debug!(
            orientation,
            rotate = ?rotate,
            flip_horizontal = flip_h,
            flip_vertical = flip_v,
            "applying EXIF orientation"
        );
    }

    img = match rotate {
        Some(90) => img.rotate90(),
        Some(180) => img.rotate180(),
        Some(270) => img.rotate270(),
        _ => img,
    };
    if flip_h {
        img = img.fliph();
    }
    if flip_v {
        img = img.flipv();
    }
    img
}
