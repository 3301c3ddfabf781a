//! Deterministic transforms applied to backend output before it is written.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use tracing::{debug, warn};

use ig_core::config::{Corner, OutputFormat, PostProcessConfig, WatermarkConfig};
use ig_core::error::{GenError, Result};
use ig_core::request::SamplerSettings;

const UNSHARP_SIGMA: f32 = 1.2;
const UNSHARP_THRESHOLD: i32 = 1;
const CONTRAST: f32 = 1.05;
const BRIGHTNESS: f32 = 1.02;
const SATURATION: f32 = 1.10;

#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

struct Watermark {
    image: RgbaImage,
    position: Corner,
    margin: u32,
}

pub struct PostProcessor {
    config: PostProcessConfig,
    width: u32,
    height: u32,
    watermark: Option<Watermark>,
}

impl PostProcessor {
    /// Watermark files are read here, once. A missing watermark is a
    /// configuration error.
    pub fn new(config: &PostProcessConfig, sampler: &SamplerSettings) -> Result<Self> {
        let watermark = config.watermark.as_ref().map(load_watermark).transpose()?;
        if !config.format.is_registrable() {
            warn!(
                format = config.format.extension(),
                "Output format is not picked up by image registration"
            );
        }
        Ok(Self {
            config: config.clone(),
            width: sampler.width,
            height: sampler.height,
            watermark,
        })
    }

    pub fn format(&self) -> OutputFormat {
        self.config.format
    }

    pub fn process(&self, raw: &[u8]) -> Result<ProcessedImage> {
        let mut img = image::load_from_memory(raw)
            .map_err(|e| GenError::PostProcess(format!("cannot decode backend output: {e}")))?;

        if self.config.resize && img.dimensions() != (self.width, self.height) {
            debug!(from = ?img.dimensions(), to = ?(self.width, self.height), "Resizing output");
            img = img.resize_exact(self.width, self.height, FilterType::Lanczos3);
        }
        if self.config.enhance {
            img = enhance(&img);
        }
        if let Some(wm) = &self.watermark {
            img = apply_watermark(img, wm);
        }

        let (width, height) = img.dimensions();
        let bytes = encode(&img, self.config.format, self.config.jpeg_quality)?;
        Ok(ProcessedImage {
            bytes,
            format: self.config.format,
            width,
            height,
        })
    }
}

fn load_watermark(config: &WatermarkConfig) -> Result<Watermark> {
    let img = image::open(&config.path).map_err(|e| {
        GenError::Configuration(format!("watermark {}: {e}", config.path.display()))
    })?;
    let mut rgba = img.to_rgba8();
    for px in rgba.pixels_mut() {
        px[3] = (px[3] as f32 * config.opacity).round() as u8;
    }
    Ok(Watermark {
        image: rgba,
        position: config.position,
        margin: config.margin,
    })
}

fn apply_watermark(img: DynamicImage, wm: &Watermark) -> DynamicImage {
    let mut base = img.to_rgba8();
    let (bw, bh) = base.dimensions();
    let (ww, wh) = wm.image.dimensions();
    let right = bw as i64 - ww as i64 - wm.margin as i64;
    let bottom = bh as i64 - wh as i64 - wm.margin as i64;
    let left = wm.margin as i64;
    let (x, y) = match wm.position {
        Corner::TopLeft => (left, left),
        Corner::TopRight => (right, left),
        Corner::BottomLeft => (left, bottom),
        Corner::BottomRight => (right, bottom),
    };
    imageops::overlay(&mut base, &wm.image, x, y);
    DynamicImage::ImageRgba8(base)
}

/// Unsharp mask followed by contrast, brightness and saturation lifts.
fn enhance(img: &DynamicImage) -> DynamicImage {
    let mut rgba = img.unsharpen(UNSHARP_SIGMA, UNSHARP_THRESHOLD).to_rgba8();

    let count = (rgba.width() as f64 * rgba.height() as f64).max(1.0);
    let mean = (rgba.pixels().map(|p| luma(p) as f64).sum::<f64>() / count) as f32;

    for px in rgba.pixels_mut() {
        let mut c = [px[0] as f32, px[1] as f32, px[2] as f32];
        for v in c.iter_mut() {
            *v = mean + (*v - mean) * CONTRAST;
            *v *= BRIGHTNESS;
        }
        let grey = 0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2];
        for (i, v) in c.iter().enumerate() {
            px[i] = (grey + (v - grey) * SATURATION).round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

fn luma(p: &Rgba<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

fn encode(img: &DynamicImage, format: OutputFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
    let err = |e: image::ImageError| GenError::PostProcess(format!("encoding {format:?} failed: {e}"));
    let mut buf = Cursor::new(Vec::new());
    match format {
        OutputFormat::Png => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut buf, ImageFormat::Png)
                .map_err(err)?;
        }
        OutputFormat::Webp => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut buf, ImageFormat::WebP)
                .map_err(err)?;
        }
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, jpeg_quality)
                .encode_image(&rgb)
                .map_err(err)?;
        }
    }
    Ok(buf.into_inner())
}

/// Resize a ControlNet reference to the generation resolution and return it
/// as base64 PNG.
pub fn prepare_reference(bytes: &[u8], width: u32, height: u32) -> Result<String> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| GenError::ReferenceImage(format!("cannot decode: {e}")))?;
    let resized = img.to_rgb8();
    let resized = DynamicImage::ImageRgb8(resized).resize_exact(width, height, FilterType::Lanczos3);
    let mut buf = Cursor::new(Vec::new());
    resized
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| GenError::ReferenceImage(format!("cannot encode: {e}")))?;
    Ok(STANDARD.encode(buf.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::backend::mock::solid_png;

    fn sampler(width: u32, height: u32) -> SamplerSettings {
        SamplerSettings {
            width,
            height,
            ..SamplerSettings::default()
        }
    }

    #[test]
    fn test_resize_and_png_output() {
        let processor = PostProcessor::new(&PostProcessConfig::default(), &sampler(16, 24)).unwrap();
        let out = processor.process(&solid_png(32, 32).unwrap()).unwrap();
        assert_eq!((out.width, out.height), (16, 24));
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (16, 24));
        assert_eq!(image::guess_format(&out.bytes).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn test_jpeg_output_and_enhancement() {
        let config = PostProcessConfig {
            enhance: true,
            format: OutputFormat::Jpeg,
            jpeg_quality: 80,
            ..PostProcessConfig::default()
        };
        let processor = PostProcessor::new(&config, &sampler(8, 8)).unwrap();
        let out = processor.process(&solid_png(8, 8).unwrap()).unwrap();
        assert_eq!(image::guess_format(&out.bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_deterministic() {
        let config = PostProcessConfig {
            enhance: true,
            ..PostProcessConfig::default()
        };
        let processor = PostProcessor::new(&config, &sampler(8, 8)).unwrap();
        let raw = solid_png(12, 12).unwrap();
        assert_eq!(processor.process(&raw).unwrap().bytes, processor.process(&raw).unwrap().bytes);
    }

    #[test]
    fn test_corrupt_input_is_post_process_error() {
        let processor = PostProcessor::new(&PostProcessConfig::default(), &sampler(8, 8)).unwrap();
        let err = processor.process(b"definitely not an image").unwrap_err();
        assert!(matches!(err, GenError::PostProcess(_)));
    }

    #[test]
    fn test_watermark_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mark.png");
        RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255])).save(&path).unwrap();

        let config = PostProcessConfig {
            watermark: Some(WatermarkConfig {
                path,
                position: Corner::BottomRight,
                opacity: 1.0,
                margin: 2,
            }),
            ..PostProcessConfig::default()
        };
        let processor = PostProcessor::new(&config, &sampler(16, 16)).unwrap();
        let out = processor.process(&solid_png(16, 16).unwrap()).unwrap();
        let img = image::load_from_memory(&out.bytes).unwrap().to_rgba8();
        assert_eq!(img.get_pixel(11, 11), &Rgba([255, 255, 255, 255]));
        assert_ne!(img.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_missing_watermark_is_configuration_error() {
        let config = PostProcessConfig {
            watermark: Some(WatermarkConfig {
                path: "/nonexistent/mark.png".into(),
                position: Corner::TopLeft,
                opacity: 0.5,
                margin: 0,
            }),
            ..PostProcessConfig::default()
        };
        assert!(matches!(
            PostProcessor::new(&config, &sampler(8, 8)),
            Err(GenError::Configuration(_))
        ));
    }

    #[test]
    fn test_prepare_reference() {
        let b64 = prepare_reference(&solid_png(40, 30).unwrap(), 8, 12).unwrap();
        let bytes = STANDARD.decode(b64).unwrap();
        assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (8, 12));
        assert!(matches!(prepare_reference(b"xx", 8, 8), Err(GenError::ReferenceImage(_))));
    }
}
