//! Image compression selection.
//!
//! A pure decision table mapping `(preferred compression, bitmap shape,
//! drawable graduality)` to the compression actually used. The codec
//! implementations are external; this module only decides.

use lumen_gfx::model::Bitmap;

use crate::config::ImageCompression;
use crate::stream::CopyGraduality;

/// Images smaller than this are cheaper to send raw.
pub const MIN_SIZE_TO_COMPRESS: u64 = 54;

/// Quadric compression cannot handle tiny images.
pub const MIN_DIMENSION_TO_QUIC: u32 = 3;

/// Quic compression does not handle palettes.
fn can_quic_compress(bitmap: &Bitmap) -> bool {
    !bitmap.format.is_paletted()
        && bitmap.width >= MIN_DIMENSION_TO_QUIC
        && bitmap.height >= MIN_DIMENSION_TO_QUIC
}

/// The LZ family cannot handle rows wider than the image or unstable
/// source data.
fn can_lz_compress(bitmap: &Bitmap) -> bool {
    !bitmap.has_extra_stride() && !bitmap.is_unstable()
}

/// Resolves the compression for one bitmap. Pure: same inputs, same
/// answer.
pub fn compression_for_bitmap(
    bitmap: &Bitmap,
    preferred: ImageCompression,
    graduality: CopyGraduality,
) -> ImageCompression {
    if u64::from(bitmap.height) * u64::from(bitmap.stride) < MIN_SIZE_TO_COMPRESS {
        return ImageCompression::Off;
    }
    if preferred == ImageCompression::Off {
        return ImageCompression::Off;
    }
    if preferred == ImageCompression::Quic {
        return if can_quic_compress(bitmap) {
            ImageCompression::Quic
        } else {
            ImageCompression::Off
        };
    }

    let mut preferred = preferred;
    if preferred == ImageCompression::AutoGlz || preferred == ImageCompression::AutoLz {
        if can_quic_compress(bitmap) {
            match graduality {
                CopyGraduality::Invalid => {
                    if bitmap.format.has_graduality()
                        && bitmap.graduality_level() == lumen_gfx::Graduality::High
                    {
                        return ImageCompression::Quic;
                    }
                }
                CopyGraduality::High => return ImageCompression::Quic,
                _ => {}
            }
            if !can_lz_compress(bitmap) {
                return ImageCompression::Quic;
            }
        }
        preferred = if preferred == ImageCompression::AutoLz {
            ImageCompression::Lz
        } else {
            ImageCompression::Glz
        };
    }

    if preferred == ImageCompression::Glz && !bitmap.format.has_graduality() {
        preferred = ImageCompression::Lz;
    }
    if preferred == ImageCompression::Lz4 && !bitmap.format.is_rgb() {
        preferred = ImageCompression::Lz;
    }

    if matches!(
        preferred,
        ImageCompression::Lz | ImageCompression::Lz4 | ImageCompression::Glz
    ) {
        return if can_lz_compress(bitmap) {
            preferred
        } else {
            ImageCompression::Off
        };
    }

    ImageCompression::Off
}
