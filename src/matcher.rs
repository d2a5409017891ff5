/// Multi-scale template matching
///
/// Pure functions: given a grayscale screen and a grayscale template, find the
/// best zero-mean normalized cross-correlation score over a set of template
/// scales. Scores are in [-1, 1]; only high positive scores mean a match.
use std::borrow::Cow;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::template_matching::find_extremes;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Scale factors tried for each template
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleRange {
    pub min: f32,
    pub max: f32,
    /// Evenly spaced samples between `min` and `max`, both inclusive
    pub samples: usize,
}

impl Default for ScaleRange {
    fn default() -> Self {
        Self {
            min: 0.8,
            max: 1.2,
            samples: 10,
        }
    }
}

impl ScaleRange {
    /// Single pass with the template as-is
    pub const fn unscaled() -> Self {
        Self {
            min: 1.0,
            max: 1.0,
            samples: 1,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let valid = self.samples >= 1
            && self.min.is_finite()
            && self.max.is_finite()
            && self.min > 0.0
            && self.min <= self.max;
        if valid {
            Ok(())
        } else {
            Err(ValidationError::InvalidScaleRange {
                min: self.min,
                max: self.max,
                samples: self.samples,
            })
        }
    }

    /// Distance between neighbouring samples (0 for a single sample)
    pub fn resolution(&self) -> f32 {
        if self.samples <= 1 {
            0.0
        } else {
            (self.max - self.min) / (self.samples - 1) as f32
        }
    }

    /// Scale factors in ascending order.
    ///
    /// The identity scale is always included when it lies inside the range,
    /// so an unscaled copy of a template is found with its exact size.
    pub fn factors(&self) -> Vec<f32> {
        let mut factors: Vec<f32> = if self.samples <= 1 || self.min == self.max {
            vec![self.min]
        } else {
            let step = self.resolution();
            (0..self.samples)
                .map(|i| self.min + step * i as f32)
                .collect()
        };

        let has_identity = factors.iter().any(|f| (f - 1.0).abs() < 1e-4);
        if !has_identity && self.min <= 1.0 && 1.0 <= self.max {
            let pos = factors.partition_point(|&f| f < 1.0);
            factors.insert(pos, 1.0);
        }
        factors
    }
}

/// Best location of a template inside a screen
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub score: f32,
    /// Center of the matched area, in screen pixels
    pub x: u32,
    pub y: u32,
    pub scale: f32,
    /// Top-left of the matched area
    pub left: u32,
    pub top: u32,
    /// Size of the template after resizing
    pub width: u32,
    pub height: u32,
}

/// Search every scale and return the single best candidate, qualifying or not.
///
/// Scales are visited in ascending order and a candidate only replaces the
/// current best when its score is strictly higher, so ties keep the first one.
pub fn find_best(screen: &GrayImage, template: &GrayImage, scales: &ScaleRange) -> Option<MatchResult> {
    let mut best: Option<MatchResult> = None;

    for (scale, (nw, nh)) in distinct_sizes(template.dimensions(), scales) {
        let resized = resize_to(template, nw, nh);
        let Some(scores) = correlate(screen, &resized) else {
            continue;
        };

        let extremes = find_extremes(&scores);
        let (left, top) = extremes.max_value_location;
        let candidate = MatchResult {
            score: extremes.max_value,
            x: left + nw / 2,
            y: top + nh / 2,
            scale,
            left,
            top,
            width: nw,
            height: nh,
        };

        if best.map_or(true, |b| candidate.score > b.score) {
            best = Some(candidate);
        }
    }

    best
}

/// One `(scale, size)` pair per distinct resized size, in ascending order.
///
/// Small templates round neighbouring factors to the same pixel size. Each
/// such run is searched once and reported with the factor nearest to the
/// size it actually produces, so the unscaled size always reports 1.0 when
/// 1.0 is in range.
fn distinct_sizes((w, h): (u32, u32), scales: &ScaleRange) -> Vec<(f32, (u32, u32))> {
    let mut steps: Vec<(f32, (u32, u32))> = Vec::new();

    for factor in scales.factors() {
        let size = scaled_size(w, h, factor);
        let effective = (size.0 as f32 / w.max(1) as f32 + size.1 as f32 / h.max(1) as f32) / 2.0;

        match steps.last_mut() {
            Some((kept, last)) if *last == size => {
                if (factor - effective).abs() < (*kept - effective).abs() {
                    *kept = factor;
                }
            }
            _ => steps.push((factor, size)),
        }
    }

    steps
}

/// Best match whose score strictly exceeds `threshold`
pub fn locate(
    screen: &GrayImage,
    template: &GrayImage,
    scales: &ScaleRange,
    threshold: f32,
) -> Option<MatchResult> {
    find_best(screen, template, scales).filter(|m| m.score > threshold)
}

/// Resize with linear interpolation; the new size is `round(size * scale)`, at least 1
pub fn resize_template(template: &GrayImage, scale: f32) -> Cow<'_, GrayImage> {
    let (w, h) = template.dimensions();
    let (nw, nh) = scaled_size(w, h, scale);
    resize_to(template, nw, nh)
}

fn scaled_size(w: u32, h: u32, scale: f32) -> (u32, u32) {
    (
        ((w as f32) * scale).round().max(1.0) as u32,
        ((h as f32) * scale).round().max(1.0) as u32,
    )
}

fn resize_to(template: &GrayImage, nw: u32, nh: u32) -> Cow<'_, GrayImage> {
    if (nw, nh) == template.dimensions() {
        Cow::Borrowed(template)
    } else {
        Cow::Owned(imageops::resize(template, nw, nh, FilterType::Triangle))
    }
}

/// Zero-mean normalized cross-correlation map (TM_CCOEFF_NORMED).
///
/// Entry (x, y) scores the template placed with its top-left at (x, y).
/// Returns `None` when the template is empty or larger than the screen.
/// Windows or templates without any variance score 0.
pub fn correlate(screen: &GrayImage, template: &GrayImage) -> Option<Image<Luma<f32>>> {
    let (sw, sh) = screen.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > sw || th > sh {
        return None;
    }

    let n = (tw as u64) * (th as u64);
    let t_raw = template.as_raw();
    let t_sum: u64 = t_raw.iter().map(|&p| p as u64).sum();
    let t_sq: u64 = t_raw.iter().map(|&p| (p as u64) * (p as u64)).sum();
    let t_var_n = (n as i128) * (t_sq as i128) - (t_sum as i128) * (t_sum as i128);

    let out_w = (sw - tw + 1) as usize;
    let out_h = (sh - th + 1) as usize;
    let mut scores = vec![0f32; out_w * out_h];

    if t_var_n > 0 {
        let t_mean = t_sum as f64 / n as f64;
        let t_dev: Vec<f64> = t_raw.iter().map(|&p| p as f64 - t_mean).collect();
        let t_norm = t_var_n as f64 / n as f64;
        let integrals = Integrals::new(screen);
        let s_raw = screen.as_raw();
        let (sw, tw, th) = (sw as usize, tw as usize, th as usize);

        scores
            .par_chunks_mut(out_w)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, score) in row.iter_mut().enumerate() {
                    let (sum, sq) = integrals.window(x, y, tw, th);
                    let var_n = (n as i128) * (sq as i128) - (sum as i128) * (sum as i128);
                    if var_n <= 0 {
                        continue;
                    }

                    let mut num = 0f64;
                    for ty in 0..th {
                        let start = (y + ty) * sw + x;
                        let s_row = &s_raw[start..start + tw];
                        let t_row = &t_dev[ty * tw..(ty + 1) * tw];
                        num += s_row
                            .iter()
                            .zip(t_row)
                            .map(|(&p, &t)| p as f64 * t)
                            .sum::<f64>();
                    }

                    let var = var_n as f64 / n as f64;
                    *score = (num / (var * t_norm).sqrt()).clamp(-1.0, 1.0) as f32;
                }
            });
    }

    Image::from_raw(out_w as u32, out_h as u32, scores)
}

/// Summed-area tables of pixel values and squared values
struct Integrals {
    stride: usize,
    sum: Vec<u64>,
    sq: Vec<u64>,
}

impl Integrals {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row_sum += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row_sum;
                sq[idx] = sq[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq }
    }

    /// Sum and squared sum of the `w` x `h` window with top-left (x, y)
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (u64, u64) {
        let s = self.stride;
        let (a, b) = (y * s + x, y * s + x + w);
        let (c, d) = ((y + h) * s + x, (y + h) * s + x + w);
        (
            self.sum[d] + self.sum[a] - self.sum[b] - self.sum[c],
            self.sq[d] + self.sq[a] - self.sq[b] - self.sq[c],
        )
    }
}
