//! Page normalization: every page handed to the translator is an opaque RGB
//! JPEG, whatever the site served.

use image::{DynamicImage, ImageFormat, ImageResult, Rgb, RgbImage};
use std::io::Cursor;

/// Width of the zero-padded page sequence (`001.jpg`).
pub const PAGE_NUMBER_WIDTH: usize = 3;

pub fn page_file_name(index: usize) -> String {
    format!("{:0width$}.jpg", index + 1, width = PAGE_NUMBER_WIDTH)
}

/// Decodes any supported format, flattens transparency onto white and
/// re-encodes as JPEG.
pub fn normalize_to_jpeg(bytes: &[u8]) -> ImageResult<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)?;
    encode_jpeg(flatten_onto_white(&decoded))
}

pub fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u16::from(a);
        let blend = |channel: u8| -> u8 {
            let value = (u16::from(channel) * alpha + 255 * (255 - alpha) + 127) / 255;
            value as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    flattened
}

fn encode_jpeg(image: RgbImage) -> ImageResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image).write_to(&mut buffer, ImageFormat::Jpeg)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png_bytes(image: RgbaImage) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn transparent_pixels_become_white() {
        let mut source = RgbaImage::new(2, 1);
        source.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        source.put_pixel(1, 0, Rgba([10, 20, 30, 255]));

        let flattened = flatten_onto_white(&DynamicImage::ImageRgba8(source));
        assert_eq!(flattened.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(flattened.get_pixel(1, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn normalized_output_is_jpeg() {
        let bytes = png_bytes(RgbaImage::from_pixel(4, 4, Rgba([200, 0, 0, 128])));
        let jpeg = normalize_to_jpeg(&bytes).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(normalize_to_jpeg(b"<html>not an image</html>").is_err());
    }

    #[test]
    fn page_names_are_zero_padded() {
        assert_eq!(page_file_name(0), "001.jpg");
        assert_eq!(page_file_name(41), "042.jpg");
    }
}
