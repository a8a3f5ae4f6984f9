//! Copy-time augmentation: a zoom-out with padding followed by an optional
//! blur. Boxes are rewritten to stay on the same leaf region.

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use leafguard_core::config::AugmentationConfig;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;

use crate::labels::YoloBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurKind {
    Gaussian,
    Median,
    Motion,
}

impl BlurKind {
    const ORDER: [BlurKind; 3] = [BlurKind::Gaussian, BlurKind::Median, BlurKind::Motion];
}

/// Shrink the image by `scale` and center it on a `pad_color` canvas of the
/// original size.
pub fn zoom_out(img: &RgbImage, boxes: &[YoloBox], scale: f32, pad_color: [u8; 3]) -> (RgbImage, Vec<YoloBox>) {
    let (width, height) = img.dimensions();
    let scale = scale.clamp(0.01, 1.0);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, width.max(1));
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, height.max(1));

    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(width, height, Rgb(pad_color));
    let pad_x = (width - new_w) / 2;
    let pad_y = (height - new_h) / 2;
    image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    // actual per-axis scale after rounding
    let sx = new_w as f32 / width as f32;
    let sy = new_h as f32 / height as f32;
    let ox = pad_x as f32 / width as f32;
    let oy = pad_y as f32 / height as f32;

    let boxes = boxes
        .iter()
        .map(|b| YoloBox {
            class_id: b.class_id,
            cx: b.cx * sx + ox,
            cy: b.cy * sy + oy,
            w: b.w * sx,
            h: b.h * sy,
        })
        .collect();

    (canvas, boxes)
}

/// Pick a blur kind by relative weight. All-zero weights fall back to gaussian.
pub fn choose_blur<R: Rng + ?Sized>(weights: [u32; 3], rng: &mut R) -> BlurKind {
    match WeightedIndex::new(weights) {
        Ok(dist) => BlurKind::ORDER[dist.sample(rng)],
        Err(_) => BlurKind::Gaussian,
    }
}

pub fn apply_blur(img: &RgbImage, kind: BlurKind, config: &AugmentationConfig) -> RgbImage {
    match kind {
        BlurKind::Gaussian => image::imageops::blur(img, config.gaussian_sigma.max(0.1)),
        BlurKind::Median => {
            let r = config.median_radius.max(1);
            imageproc::filter::median_filter(img, r, r)
        }
        BlurKind::Motion => {
            let len = config.motion_length.max(1) as usize;
            let kernel = vec![1.0f32 / len as f32; len];
            imageproc::filter::horizontal_filter(img, &kernel)
        }
    }
}

/// Run the pipeline on one sample.
///
/// Returns `None` when the sample is not selected; the caller then copies the
/// original untouched.
pub fn augment_sample<R: Rng + ?Sized>(
    img: &RgbImage,
    boxes: &[YoloBox],
    config: &AugmentationConfig,
    rng: &mut R,
) -> Option<(RgbImage, Vec<YoloBox>)> {
    if !rng.random_bool(config.probability.clamp(0.0, 1.0)) {
        return None;
    }

    let (lo, hi) = if config.zoom_min <= config.zoom_max {
        (config.zoom_min, config.zoom_max)
    } else {
        (config.zoom_max, config.zoom_min)
    };
    let scale = if hi > lo { rng.random_range(lo..=hi) } else { lo };
    let (mut out, out_boxes) = zoom_out(img, boxes, scale, config.pad_color);

    if rng.random_bool(config.blur_probability.clamp(0.0, 1.0)) {
        let kind = choose_blur(config.blur_weights, rng);
        tracing::trace!(?kind, scale, "Applying blur");
        out = apply_blur(&out, kind, config);
    }

    Some((out, out_boxes))
}
