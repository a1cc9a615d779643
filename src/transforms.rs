//! Image transform pipelines.
//!
//! [`PairTransform`] runs the same ordered list of operations over a satellite/map pair. Every
//! random decision for one access is drawn up front into [`PairParams`] and then applied to both
//! images, so the pair keeps its spatial correspondence. [`ColorPipeline`] is the satellite-only
//! photometric jitter and never sees the map image.

use image::{Rgb, RgbImage};
use rand::seq::SliceRandom;
use rand::Rng;
use tch::{Kind, Tensor};

use crate::error::TransformError;

pub const NORM_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const NORM_STD: [f32; 3] = [0.5, 0.5, 0.5];

const GRID_NEAREST: i64 = 1;
const GRID_ZEROS: i64 = 0;

/// Sampling ranges of a random affine transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineRange {
    /// Rotation is drawn from `(-degrees, degrees)`.
    pub degrees: f64,
    /// Maximum translation as a fraction of width and height.
    pub translate: Option<(f64, f64)>,
    pub scale: Option<(f64, f64)>,
    pub shear_x: Option<(f64, f64)>,
    pub shear_y: Option<(f64, f64)>,
}

/// One sampled affine transform. `translate` is kept as a fraction of the image size and turned
/// into whole pixels when applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub angle: f64,
    pub translate: (f64, f64),
    pub scale: f64,
    pub shear: (f64, f64),
}

impl AffineParams {
    pub fn rotation(angle: f64) -> Self {
        Self {
            angle,
            translate: (0.0, 0.0),
            scale: 1.0,
            shear: (0.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairOp {
    /// Resize the shorter edge to `size`, keeping the aspect ratio.
    Resize { size: i64 },
    /// uint8 -> float32 in [0, 1].
    ToFloat,
    Normalize { mean: [f32; 3], std: [f32; 3] },
    RandomAffine(AffineRange),
    HorizontalFlip { p: f64 },
    ChannelPermutation,
}

impl PairOp {
    fn describe(&self) -> String {
        match self {
            PairOp::Resize { size } => format!("resize({size})"),
            PairOp::ToFloat => "to_float".to_string(),
            PairOp::Normalize { mean, std } => format!("normalize(mean={mean:?}, std={std:?})"),
            PairOp::RandomAffine(r) => format!(
                "random_affine(degrees={}, translate={:?}, scale={:?}, shear={:?}/{:?})",
                r.degrees, r.translate, r.scale, r.shear_x, r.shear_y
            ),
            PairOp::HorizontalFlip { p } => format!("hflip(p={p:.2})"),
            PairOp::ChannelPermutation => "channel_permutation".to_string(),
        }
    }
}

/// Random decisions for a single pair access.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairParams {
    pub affine: Option<AffineParams>,
    pub flip: bool,
    pub permutation: [i64; 3],
}

impl Default for PairParams {
    fn default() -> Self {
        Self {
            affine: None,
            flip: false,
            permutation: [0, 1, 2],
        }
    }
}

/// Ordered, immutable pipeline applied jointly to a (source, target) pair. Inputs are converted
/// to uint8 CHW tensors before the first op.
#[derive(Debug, Clone, PartialEq)]
pub struct PairTransform {
    ops: Vec<PairOp>,
}

impl PairTransform {
    /// to-image, to-float, normalize. Used when a dataset is built without a transform.
    pub fn minimal() -> Self {
        Self {
            ops: vec![
                PairOp::ToFloat,
                PairOp::Normalize {
                    mean: NORM_MEAN,
                    std: NORM_STD,
                },
            ],
        }
    }

    pub fn ops(&self) -> &[PairOp] {
        &self.ops
    }

    pub fn describe(&self) -> String {
        std::iter::once("to_image".to_string())
            .chain(self.ops.iter().map(PairOp::describe))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Draw every random decision of one access. Ops consume the RNG in pipeline order.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> PairParams {
        let mut params = PairParams::default();
        for op in &self.ops {
            match op {
                PairOp::RandomAffine(range) => params.affine = Some(sample_affine(range, rng)),
                PairOp::HorizontalFlip { p } => params.flip = rng.gen_bool(*p),
                PairOp::ChannelPermutation => params.permutation.shuffle(rng),
                _ => {}
            }
        }
        params
    }

    pub fn apply<R: Rng + ?Sized>(
        &self,
        source: &RgbImage,
        target: &RgbImage,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor), tch::TchError> {
        let params = self.sample(rng);
        self.apply_with(source, target, &params)
    }

    /// Apply the pipeline with already sampled decisions.
    pub fn apply_with(
        &self,
        source: &RgbImage,
        target: &RgbImage,
        params: &PairParams,
    ) -> Result<(Tensor, Tensor), tch::TchError> {
        let mut source = rgb_to_tensor(source)?;
        let mut target = rgb_to_tensor(target)?;
        for op in &self.ops {
            source = apply_op(op, &source, params)?;
            target = apply_op(op, &target, params)?;
        }
        Ok((source, target))
    }
}

/// Build the paired pipeline for one split. Fails on malformed parameters so nothing invalid
/// reaches sample access.
pub fn build_transform(
    size: i64,
    degrees: f64,
    translate: Option<(f64, f64)>,
    flip_p: f64,
    scale: Option<(f64, f64)>,
    shear: Option<&[f64]>,
    channel_shuffle: bool,
) -> Result<PairTransform, TransformError> {
    if size < 1 {
        return Err(TransformError::Size(size));
    }
    if !sampleable(-degrees, degrees) || degrees < 0.0 {
        return Err(TransformError::OutOfRange {
            field: "degrees",
            msg: format!("expected a finite non-negative angle, got {degrees}"),
        });
    }
    if let Some((tx, ty)) = translate {
        for v in [tx, ty] {
            if !(0.0..=1.0).contains(&v) {
                return Err(TransformError::OutOfRange {
                    field: "translate",
                    msg: format!("fractions must lie in [0, 1], got ({tx}, {ty})"),
                });
            }
        }
    }
    if !(0.0..=1.0).contains(&flip_p) {
        return Err(TransformError::OutOfRange {
            field: "flip_p",
            msg: format!("probability must lie in [0, 1], got {flip_p}"),
        });
    }
    if let Some((lo, hi)) = scale {
        check_range("scale", lo, hi)?;
        if lo <= 0.0 {
            return Err(TransformError::OutOfRange {
                field: "scale",
                msg: format!("scale factors must be positive, got ({lo}, {hi})"),
            });
        }
    }
    let (shear_x, shear_y) = match shear {
        None | Some([]) => (None, None),
        Some(&[s]) => {
            if !sampleable(-s, s) || s < 0.0 {
                return Err(TransformError::OutOfRange {
                    field: "shear",
                    msg: format!("a single shear value must be finite and non-negative, got {s}"),
                });
            }
            (Some((-s, s)), None)
        }
        Some(&[lo, hi]) => {
            check_range("shear", lo, hi)?;
            (Some((lo, hi)), None)
        }
        Some(&[xlo, xhi, ylo, yhi]) => {
            check_range("shear", xlo, xhi)?;
            check_range("shear", ylo, yhi)?;
            (Some((xlo, xhi)), Some((ylo, yhi)))
        }
        Some(other) => {
            return Err(TransformError::OutOfRange {
                field: "shear",
                msg: format!("expected 1, 2 or 4 values, got {}", other.len()),
            })
        }
    };

    let mut ops = vec![
        PairOp::Resize { size },
        PairOp::ToFloat,
        PairOp::Normalize {
            mean: NORM_MEAN,
            std: NORM_STD,
        },
    ];
    if degrees != 0.0 || translate.is_some() || scale.is_some() || shear_x.is_some() {
        ops.push(PairOp::RandomAffine(AffineRange {
            degrees,
            translate,
            scale,
            shear_x,
            shear_y,
        }));
    }
    if flip_p > 0.0 {
        ops.push(PairOp::HorizontalFlip { p: flip_p });
    }
    if channel_shuffle {
        ops.push(PairOp::ChannelPermutation);
    }
    Ok(PairTransform { ops })
}

/// Whether `lo..=hi` can be sampled uniformly without the width overflowing.
fn sampleable(lo: f64, hi: f64) -> bool {
    (2.0 * (hi - lo)).is_finite()
}

fn check_range(field: &'static str, lo: f64, hi: f64) -> Result<(), TransformError> {
    if !sampleable(lo, hi) {
        return Err(TransformError::OutOfRange {
            field,
            msg: format!("bounds must be finite and span a finite width, got ({lo}, {hi})"),
        });
    }
    if lo > hi {
        return Err(TransformError::InvertedRange { field, lo, hi });
    }
    Ok(())
}

fn sample_affine<R: Rng + ?Sized>(range: &AffineRange, rng: &mut R) -> AffineParams {
    let angle = rng.gen_range(-range.degrees..=range.degrees);
    let translate = match range.translate {
        Some((tx, ty)) => (rng.gen_range(-tx..=tx), rng.gen_range(-ty..=ty)),
        None => (0.0, 0.0),
    };
    let scale = match range.scale {
        Some((lo, hi)) => rng.gen_range(lo..=hi),
        None => 1.0,
    };
    let shear_x = range.shear_x.map_or(0.0, |(lo, hi)| rng.gen_range(lo..=hi));
    let shear_y = range.shear_y.map_or(0.0, |(lo, hi)| rng.gen_range(lo..=hi));
    AffineParams {
        angle,
        translate,
        scale,
        shear: (shear_x, shear_y),
    }
}

/// RGB8 image to a uint8 [3, H, W] tensor.
pub fn rgb_to_tensor(img: &RgbImage) -> Result<Tensor, tch::TchError> {
    let (w, h) = img.dimensions();
    Tensor::f_from_slice(img.as_raw().as_slice())?
        .f_view([h as i64, w as i64, 3])?
        .f_permute([2, 0, 1])
}

fn apply_op(op: &PairOp, xs: &Tensor, params: &PairParams) -> Result<Tensor, tch::TchError> {
    match op {
        PairOp::Resize { size } => resize_shorter_edge(xs, *size),
        PairOp::ToFloat => Ok(xs.f_to_kind(Kind::Float)? / 255.0),
        PairOp::Normalize { mean, std } => {
            let mean = Tensor::f_from_slice(&mean[..])?.f_view([3, 1, 1])?;
            let std = Tensor::f_from_slice(&std[..])?.f_view([3, 1, 1])?;
            xs.f_sub(&mean)?.f_div(&std)
        }
        PairOp::RandomAffine(_) => match &params.affine {
            Some(affine) => apply_affine(xs, affine),
            None => Ok(xs.shallow_clone()),
        },
        PairOp::HorizontalFlip { .. } => {
            if params.flip {
                xs.f_flip([-1])
            } else {
                Ok(xs.shallow_clone())
            }
        }
        PairOp::ChannelPermutation => {
            let index = Tensor::f_from_slice(&params.permutation[..])?;
            xs.f_index_select(0, &index)
        }
    }
}

fn resize_shorter_edge(xs: &Tensor, size: i64) -> Result<Tensor, tch::TchError> {
    let dims = xs.size();
    let (h, w) = (dims[1], dims[2]);
    let (nh, nw) = if h <= w {
        (size, size * w / h)
    } else {
        (size * h / w, size)
    };
    if (nh, nw) == (h, w) {
        return Ok(xs.shallow_clone());
    }
    let xs = xs.f_to_kind(Kind::Float)?.f_unsqueeze(0)?;
    // Anti-aliased kernel when shrinking.
    let resized = if nh < h || nw < w {
        xs.f_internal_upsample_bilinear2d_aa([nh, nw], false, None::<f64>, None::<f64>)?
    } else {
        xs.f_upsample_bilinear2d([nh, nw], false, None::<f64>, None::<f64>)?
    };
    resized
        .f_squeeze_dim(0)?
        .f_round()?
        .f_clamp(0.0, 255.0)?
        .f_to_kind(Kind::Uint8)
}

/// Inverse of the rotate/scale/shear/translate matrix about the image centre, in pixels.
fn inverse_affine_matrix(p: &AffineParams, width: f64, height: f64) -> [f64; 6] {
    // Positive angles rotate counter-clockwise on screen, where y points down.
    let rot = (-p.angle).to_radians();
    let sx = p.shear.0.to_radians();
    let sy = p.shear.1.to_radians();
    let tx = (p.translate.0 * width).round();
    let ty = (p.translate.1 * height).round();

    let a = (rot - sy).cos() / sy.cos();
    let b = -(rot - sy).cos() * sx.tan() / sy.cos() - rot.sin();
    let c = (rot - sy).sin() / sy.cos();
    let d = -(rot - sy).sin() * sx.tan() / sy.cos() + rot.cos();

    let mut m = [d, -b, 0.0, -c, a, 0.0].map(|v| v / p.scale);
    m[2] += m[0] * -tx + m[1] * -ty;
    m[5] += m[3] * -tx + m[4] * -ty;
    m
}

fn apply_affine(xs: &Tensor, params: &AffineParams) -> Result<Tensor, tch::TchError> {
    let dims = xs.size();
    let (c, h, w) = (dims[0], dims[1], dims[2]);
    let (wf, hf) = (w as f64, h as f64);
    let m = inverse_affine_matrix(params, wf, hf);
    // Pixel-space matrix rescaled to the [-1, 1] grid of grid_sampler.
    let theta = [
        m[0],
        m[1] * hf / wf,
        2.0 * m[2] / wf,
        m[3] * wf / hf,
        m[4],
        2.0 * m[5] / hf,
    ]
    .map(|v| v as f32);
    let theta = Tensor::f_from_slice(&theta[..])?
        .f_view([1, 2, 3])?
        .f_to_device(xs.device())?;
    let grid = Tensor::f_affine_grid_generator(&theta, [1, c, h, w], false)?;
    xs.f_unsqueeze(0)?
        .f_grid_sampler(&grid, GRID_NEAREST, GRID_ZEROS, false)?
        .f_squeeze_dim(0)
}

/// Satellite-only photometric jitter: brightness, contrast and saturation in random order, then
/// an occasional sharpness boost. Works on the decoded RGB image.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorPipeline {
    brightness: (f64, f64),
    contrast: (f64, f64),
    saturation: (f64, f64),
    sharpness_factor: f64,
    sharpness_p: f64,
}

#[derive(Debug, Clone, Copy)]
enum ColorOp {
    Brightness,
    Contrast,
    Saturation,
}

impl ColorPipeline {
    pub fn new(
        brightness: (f64, f64),
        contrast: (f64, f64),
        saturation: (f64, f64),
        sharpness_factor: f64,
        sharpness_p: f64,
    ) -> Result<Self, TransformError> {
        for (field, (lo, hi)) in [
            ("brightness", brightness),
            ("contrast", contrast),
            ("saturation", saturation),
        ] {
            check_range(field, lo, hi)?;
            if lo < 0.0 {
                return Err(TransformError::OutOfRange {
                    field,
                    msg: format!("factors must be non-negative, got ({lo}, {hi})"),
                });
            }
        }
        if !sharpness_factor.is_finite() || sharpness_factor < 0.0 {
            return Err(TransformError::OutOfRange {
                field: "sharpness",
                msg: format!("factor must be non-negative, got {sharpness_factor}"),
            });
        }
        if !(0.0..=1.0).contains(&sharpness_p) {
            return Err(TransformError::OutOfRange {
                field: "sharpness_p",
                msg: format!("probability must lie in [0, 1], got {sharpness_p}"),
            });
        }
        Ok(Self {
            brightness,
            contrast,
            saturation,
            sharpness_factor,
            sharpness_p,
        })
    }

    /// The jitter used for satellite photos during training.
    pub fn satellite() -> Self {
        Self {
            brightness: (0.5, 1.5),
            contrast: (0.5, 1.5),
            saturation: (0.5, 1.5),
            sharpness_factor: 1.5,
            sharpness_p: 0.5,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "color_jitter(brightness={:?}, contrast={:?}, saturation={:?}) -> sharpness({}, p={})",
            self.brightness, self.contrast, self.saturation, self.sharpness_factor, self.sharpness_p
        )
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let mut order = [ColorOp::Brightness, ColorOp::Contrast, ColorOp::Saturation];
        order.shuffle(rng);
        let mut out = img.clone();
        for op in order {
            out = match op {
                ColorOp::Brightness => {
                    let f = rng.gen_range(self.brightness.0..=self.brightness.1);
                    adjust_brightness(&out, f as f32)
                }
                ColorOp::Contrast => {
                    let f = rng.gen_range(self.contrast.0..=self.contrast.1);
                    adjust_contrast(&out, f as f32)
                }
                ColorOp::Saturation => {
                    let f = rng.gen_range(self.saturation.0..=self.saturation.1);
                    adjust_saturation(&out, f as f32)
                }
            };
        }
        if rng.gen_bool(self.sharpness_p) {
            out = adjust_sharpness(&out, self.sharpness_factor as f32);
        }
        out
    }
}

fn luma(p: &Rgb<u8>) -> f32 {
    (p[0] as f32 * 299.0 + p[1] as f32 * 587.0 + p[2] as f32 * 114.0) / 1000.0
}

fn blend(degenerate: f32, value: u8, factor: f32) -> u8 {
    (degenerate + factor * (value as f32 - degenerate))
        .round()
        .clamp(0.0, 255.0) as u8
}

fn adjust_brightness(img: &RgbImage, factor: f32) -> RgbImage {
    let mut out = img.clone();
    for p in out.pixels_mut() {
        for c in p.0.iter_mut() {
            *c = blend(0.0, *c, factor);
        }
    }
    out
}

fn adjust_contrast(img: &RgbImage, factor: f32) -> RgbImage {
    let n = (img.width() as f64 * img.height() as f64).max(1.0);
    let mean = (img.pixels().map(|p| luma(p) as f64).sum::<f64>() / n).round() as f32;
    let mut out = img.clone();
    for p in out.pixels_mut() {
        for c in p.0.iter_mut() {
            *c = blend(mean, *c, factor);
        }
    }
    out
}

fn adjust_saturation(img: &RgbImage, factor: f32) -> RgbImage {
    let mut out = img.clone();
    for p in out.pixels_mut() {
        let gray = luma(p).round();
        for c in p.0.iter_mut() {
            *c = blend(gray, *c, factor);
        }
    }
    out
}

fn adjust_sharpness(img: &RgbImage, factor: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return img.clone();
    }
    let smooth = image::imageops::filter3x3(img, &[1.0, 1.0, 1.0, 1.0, 5.0, 1.0, 1.0, 1.0, 1.0]);
    let mut out = img.clone();
    // Border pixels keep their original value.
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let s = smooth.get_pixel(x, y);
            let p = out.get_pixel_mut(x, y);
            for c in 0..3 {
                p[c] = blend(s[c] as f32, p[c], factor);
            }
        }
    }
    out
}
