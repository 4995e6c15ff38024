//! Image preprocessing filters for OCR
//!
//! Optional enhancements applied between decode and recognition: resizing
//! toward a size the recognizer handles well, then colour filters.

use image::{imageops, imageops::FilterType, GrayImage, Rgba, RgbaImage};
use tracing::debug;

use crate::acquire::ImageHandle;
use crate::config::OcrPreprocessing;

/// Upscale factor never exceeds this
const MAX_AUTO_SCALE: u32 = 4;

/// Apply the configured filters, returning the handle unchanged when disabled
pub fn preprocess(handle: ImageHandle, settings: &OcrPreprocessing) -> ImageHandle {
    if !settings.enabled {
        return handle;
    }

    let (width, height) = handle.dimensions();
    let scale = settings.scale.max(auto_scale(width, height, settings.min_dimension));

    debug!(
        "Preprocessing {:?}: scale={}, grayscale={}, invert={}, contrast={}, sharpen={}, binarize={}",
        handle.source_path(),
        scale,
        settings.grayscale,
        settings.invert,
        settings.contrast,
        settings.sharpen,
        settings.binarize
    );

    // Resize first so the colour filters work at the final resolution
    let (new_width, new_height) = target_size(width, height, scale, settings.max_dimension);
    let mut pixels = if (new_width, new_height) == (width, height) {
        handle.pixels().clone()
    } else {
        debug!("Resizing {}x{} to {}x{}", width, height, new_width, new_height);
        imageops::resize(handle.pixels(), new_width, new_height, FilterType::Triangle)
    };

    if (settings.contrast - 1.0).abs() > 0.01 {
        apply_contrast(&mut pixels, settings.contrast);
    }

    if settings.sharpen > 0.01 {
        pixels = apply_sharpen(&pixels, settings.sharpen);
    }

    if settings.grayscale {
        apply_grayscale(&mut pixels);
    }

    if settings.invert {
        imageops::invert(&mut pixels);
    }

    if settings.binarize {
        apply_binarize(&mut pixels);
    }

    handle.with_pixels(pixels)
}

/// Upscale factor for small images (recognizers need ~40px glyph height)
pub fn auto_scale(width: u32, height: u32, min_dimension: u32) -> u32 {
    if min_dimension == 0 || (width >= min_dimension && height >= min_dimension) {
        return 1;
    }
    let height_scale = min_dimension.div_ceil(height.max(1));
    let width_scale = min_dimension.div_ceil(width.max(1));
    height_scale.max(width_scale).clamp(2, MAX_AUTO_SCALE)
}

/// Size after upscaling by `scale` with the longest side capped at
/// `max_dimension` (0 disables the cap), so only one resample is needed
fn target_size(width: u32, height: u32, scale: u32, max_dimension: u32) -> (u32, u32) {
    let scaled_width = u64::from(width) * u64::from(scale);
    let scaled_height = u64::from(height) * u64::from(scale);
    let longest = scaled_width.max(scaled_height);

    if max_dimension == 0 || longest <= u64::from(max_dimension) {
        let clamp = |v: u64| v.min(u64::from(u32::MAX)) as u32;
        return (clamp(scaled_width), clamp(scaled_height));
    }

    let ratio = f64::from(max_dimension) / longest as f64;
    let fit = |v: u64| ((v as f64 * ratio).round() as u32).max(1);
    (fit(scaled_width), fit(scaled_height))
}

/// Contrast around the midpoint; factor > 1.0 increases contrast
fn apply_contrast(pixels: &mut RgbaImage, factor: f32) {
    for Rgba(px) in pixels.pixels_mut() {
        for channel in px.iter_mut().take(3) {
            let adjusted = ((*channel as f32 - 128.0) * factor + 128.0).clamp(0.0, 255.0);
            *channel = adjusted as u8;
        }
    }
}

/// Luminance grayscale, keeping the RGBA layout
fn apply_grayscale(pixels: &mut RgbaImage) {
    for Rgba(px) in pixels.pixels_mut() {
        let gray = luma(px);
        px[0] = gray;
        px[1] = gray;
        px[2] = gray;
    }
}

/// 3x3 sharpen: centre weight 1 + 4*strength, direct neighbours -strength.
/// Border pixels are left as-is.
fn apply_sharpen(pixels: &RgbaImage, strength: f32) -> RgbaImage {
    let (width, height) = pixels.dimensions();
    let mut result = pixels.clone();
    if width < 3 || height < 3 {
        return result;
    }

    let center_weight = 1.0 + 4.0 * strength;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = pixels.get_pixel(x, y).0;
            let top = pixels.get_pixel(x, y - 1).0;
            let bottom = pixels.get_pixel(x, y + 1).0;
            let left = pixels.get_pixel(x - 1, y).0;
            let right = pixels.get_pixel(x + 1, y).0;

            let out = result.get_pixel_mut(x, y);
            for c in 0..3 {
                let neighbours = top[c] as f32 + bottom[c] as f32 + left[c] as f32 + right[c] as f32;
                let value = center[c] as f32 * center_weight - neighbours * strength;
                out.0[c] = value.clamp(0.0, 255.0) as u8;
            }
        }
    }

    result
}

/// Black/white threshold at the Otsu level of the luminance histogram
fn apply_binarize(pixels: &mut RgbaImage) {
    let gray = GrayImage::from_fn(pixels.width(), pixels.height(), |x, y| {
        image::Luma([luma(&pixels.get_pixel(x, y).0)])
    });
    let level = imageproc::contrast::otsu_level(&gray);

    for (x, y, Rgba(px)) in pixels.enumerate_pixels_mut() {
        let value = if gray.get_pixel(x, y).0[0] > level { 255 } else { 0 };
        px[0] = value;
        px[1] = value;
        px[2] = value;
    }
}

fn luma(px: &[u8; 4]) -> u8 {
    (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn handle(width: u32, height: u32, color: [u8; 4]) -> ImageHandle {
        ImageHandle::new(PathBuf::from("t.png"), RgbaImage::from_pixel(width, height, Rgba(color)))
    }

    fn enabled() -> OcrPreprocessing {
        OcrPreprocessing {
            enabled: true,
            min_dimension: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_preprocessing_disabled() {
        let out = preprocess(handle(1, 1, [100, 150, 200, 255]), &OcrPreprocessing::default());
        assert_eq!(out.as_raw(), &[100, 150, 200, 255]);
    }

    #[test]
    fn test_contrast_increase() {
        let mut pixels = RgbaImage::from_pixel(1, 1, Rgba([100, 128, 200, 255]));
        apply_contrast(&mut pixels, 2.0);
        // 100 -> 72, 128 -> 128, 200 -> 272 clamped, alpha untouched
        assert_eq!(pixels.get_pixel(0, 0).0, [72, 128, 255, 255]);
    }

    #[test]
    fn test_grayscale() {
        let mut pixels = RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 255]));
        apply_grayscale(&mut pixels);
        assert_eq!(pixels.get_pixel(0, 0).0, [76, 76, 76, 255]);
    }

    #[test]
    fn test_invert() {
        let settings = OcrPreprocessing {
            invert: true,
            ..enabled()
        };
        let out = preprocess(handle(1, 1, [0, 100, 255, 255]), &settings);
        assert_eq!(out.as_raw(), &[255, 155, 0, 255]);
    }

    #[test]
    fn test_sharpen_flat_image_unchanged() {
        let pixels = RgbaImage::from_pixel(4, 4, Rgba([90, 90, 90, 255]));
        let out = apply_sharpen(&pixels, 1.0);
        assert_eq!(out, pixels);
    }

    #[test]
    fn test_binarize_splits_dark_and_light() {
        let mut pixels = RgbaImage::from_fn(4, 1, |x, _| {
            if x < 2 {
                Rgba([20, 20, 20, 255])
            } else {
                Rgba([230, 230, 230, 255])
            }
        });
        apply_binarize(&mut pixels);
        assert_eq!(pixels.get_pixel(0, 0).0[0], 0);
        assert_eq!(pixels.get_pixel(3, 0).0[0], 255);
    }

    #[test]
    fn test_auto_scale() {
        assert_eq!(auto_scale(200, 100, 80), 1);
        assert_eq!(auto_scale(200, 50, 80), 2);
        assert_eq!(auto_scale(10, 10, 80), 4);
        assert_eq!(auto_scale(10, 10, 0), 1);
    }

    #[test]
    fn test_target_size_single_resample() {
        // Upscale and cap combine into one target instead of 12000x12000 first
        assert_eq!(target_size(3000, 3000, 4, 4096), (4096, 4096));
        assert_eq!(target_size(3000, 1500, 2, 4096), (4096, 2048));
        assert_eq!(target_size(400, 200, 1, 100), (100, 50));
        assert_eq!(target_size(50, 100, 2, 4096), (100, 200));
        assert_eq!(target_size(10, 10, 1, 0), (10, 10));
        assert_eq!(target_size(10, 10, 3, 0), (30, 30));
    }

    #[test]
    fn test_scaled_image_respects_cap() {
        let settings = OcrPreprocessing {
            scale: 4,
            max_dimension: 64,
            ..enabled()
        };
        let out = preprocess(handle(40, 20, [1, 1, 1, 255]), &settings);
        assert_eq!(out.dimensions(), (64, 32));
    }

    #[test]
    fn test_small_image_upscaled() {
        let settings = OcrPreprocessing {
            min_dimension: 80,
            ..enabled()
        };
        let out = preprocess(handle(50, 100, [1, 1, 1, 255]), &settings);
        assert_eq!(out.dimensions(), (100, 200));
    }

    #[test]
    fn test_large_image_downscaled() {
        let settings = OcrPreprocessing {
            max_dimension: 100,
            ..enabled()
        };
        let out = preprocess(handle(400, 200, [1, 1, 1, 255]), &settings);
        assert_eq!(out.dimensions(), (100, 50));
    }
}
