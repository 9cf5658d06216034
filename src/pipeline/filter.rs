//! Ordered chain of frame transforms
//!
//! A chain is built once and then shared read-only by the consumer thread.
//! Links run in the order they were added: the first link sees the raw
//! frame, each later link wraps the output of the one before it. A chain
//! with no links is the identity.

use std::fmt;
use std::sync::Arc;

use image::{imageops, DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::capture::{Frame, FrameMetadata, PixelFormat};
use crate::error::FilterError;

const SHARPEN: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];
const LAPLACIAN: [f32; 9] = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];
const SOBEL_HORIZONTAL: [f32; 9] = [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0];
const SOBEL_VERTICAL: [f32; 9] = [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0];

/// Built-in filters, selectable from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterKind {
    Identity,
    Grayscale,
    GaussianBlur { sigma: f32 },
    Sharpen,
    /// Laplacian edges on the luma channel
    EdgeDetect,
    SobelHorizontal,
    SobelVertical,
    BrightnessContrast { brightness: i32, contrast: f32 },
    Invert,
}

impl FilterKind {
    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::Identity => "identity",
            FilterKind::Grayscale => "grayscale",
            FilterKind::GaussianBlur { .. } => "gaussian_blur",
            FilterKind::Sharpen => "sharpen",
            FilterKind::EdgeDetect => "edge_detect",
            FilterKind::SobelHorizontal => "sobel_horizontal",
            FilterKind::SobelVertical => "sobel_vertical",
            FilterKind::BrightnessContrast { .. } => "brightness_contrast",
            FilterKind::Invert => "invert",
        }
    }

    fn apply(&self, frame: Frame) -> Result<Frame, FilterError> {
        let name = self.name();
        let img = match self {
            FilterKind::Identity => return Ok(frame),
            FilterKind::GaussianBlur { sigma } if !(sigma.is_finite() && *sigma > 0.0) => {
                return Err(FilterError::Broken {
                    filter: name.into(),
                    reason: format!("sigma must be positive, got {}", sigma),
                })
            }
            _ => to_rgb(&frame, name)?,
        };

        let out = match self {
            FilterKind::Identity => img,
            FilterKind::Grayscale => luma_to_rgb(imageops::grayscale(&img)),
            FilterKind::GaussianBlur { sigma } => imageops::blur(&img, *sigma),
            FilterKind::Sharpen => imageops::filter3x3(&img, &SHARPEN),
            FilterKind::EdgeDetect => {
                luma_to_rgb(imageops::filter3x3(&imageops::grayscale(&img), &LAPLACIAN))
            }
            FilterKind::SobelHorizontal => imageops::filter3x3(&img, &SOBEL_HORIZONTAL),
            FilterKind::SobelVertical => imageops::filter3x3(&img, &SOBEL_VERTICAL),
            FilterKind::BrightnessContrast {
                brightness,
                contrast,
            } => imageops::contrast(&imageops::brighten(&img, *brightness), *contrast),
            FilterKind::Invert => {
                let mut img = img;
                imageops::invert(&mut img);
                img
            }
        };
        Ok(repacked(frame, out))
    }
}

/// Replace the pixels of `frame` with a tightly packed image, restoring the
/// frame's channel order.
fn repacked(frame: Frame, img: RgbImage) -> Frame {
    let mut raw = img.into_raw();
    if frame.format() == PixelFormat::Bgr24 {
        swap_red_blue(&mut raw);
    }
    let packed = frame.width() * 3;
    if frame.meta.stride == packed {
        return frame.with_data(raw);
    }
    let mut meta = FrameMetadata::clone(&frame.meta);
    meta.stride = packed;
    Frame {
        data: raw.into(),
        meta: Arc::new(meta),
        timestamp: frame.timestamp,
    }
}

fn swap_red_blue(data: &mut [u8]) {
    for px in data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

fn luma_to_rgb(gray: GrayImage) -> RgbImage {
    DynamicImage::ImageLuma8(gray).to_rgb8()
}

/// Copy a packed 3-byte frame into an `RgbImage`, dropping row padding.
fn to_rgb(frame: &Frame, filter: &str) -> Result<RgbImage, FilterError> {
    let format = frame.format();
    if !matches!(format, PixelFormat::Rgb24 | PixelFormat::Bgr24) {
        return Err(FilterError::Unsupported {
            filter: filter.into(),
            format,
        });
    }

    let (w, h) = (frame.width(), frame.height());
    let row = w as usize * 3;
    let stride = match frame.meta.stride as usize {
        0 => row,
        s => s,
    };
    let needed = if h == 0 { 0 } else { stride * (h as usize - 1) + row };
    if stride < row || frame.data.len() < needed {
        return Err(FilterError::Frame {
            filter: filter.into(),
            reason: format!(
                "{} bytes (stride {}) is too small for {}x{}",
                frame.data.len(),
                stride,
                w,
                h
            ),
        });
    }

    let mut data = if stride == row {
        frame.data[..row * h as usize].to_vec()
    } else {
        frame
            .data
            .chunks(stride)
            .take(h as usize)
            .flat_map(|r| r[..row].iter().copied())
            .collect()
    };
    if format == PixelFormat::Bgr24 {
        swap_red_blue(&mut data);
    }

    RgbImage::from_raw(w, h, data).ok_or_else(|| FilterError::Frame {
        filter: filter.into(),
        reason: "buffer does not match frame size".into(),
    })
}

/// A transform supplied from outside the crate, e.g. a detection model
pub trait FrameTransform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, frame: Frame) -> Result<Frame, FilterError>;
}

struct FnTransform<F> {
    name: String,
    func: F,
}

impl<F> FrameTransform for FnTransform<F>
where
    F: Fn(Frame) -> Result<Frame, FilterError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, frame: Frame) -> Result<Frame, FilterError> {
        (self.func)(frame)
    }
}

#[derive(Clone)]
pub enum Filter {
    Builtin(FilterKind),
    Custom(Arc<dyn FrameTransform>),
}

impl Filter {
    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Frame) -> Result<Frame, FilterError> + Send + Sync + 'static,
    {
        Filter::Custom(Arc::new(FnTransform {
            name: name.into(),
            func,
        }))
    }

    pub fn name(&self) -> &str {
        match self {
            Filter::Builtin(kind) => kind.name(),
            Filter::Custom(t) => t.name(),
        }
    }

    pub fn apply(&self, frame: Frame) -> Result<Frame, FilterError> {
        match self {
            Filter::Builtin(kind) => kind.apply(frame),
            Filter::Custom(t) => t.apply(frame),
        }
    }
}

impl From<FilterKind> for Filter {
    fn from(kind: FilterKind) -> Self {
        Filter::Builtin(kind)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Builtin(kind) => fmt::Debug::fmt(kind, f),
            Filter::Custom(t) => write!(f, "Custom({})", t.name()),
        }
    }
}

/// Immutable, cheaply cloneable filter chain
#[derive(Clone, Debug)]
pub struct FilterChain {
    links: Arc<[Filter]>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self {
            links: Arc::from(Vec::new()),
        }
    }
}

impl FilterChain {
    /// The empty chain: returns every frame unchanged
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn builder() -> FilterChainBuilder {
        FilterChainBuilder::default()
    }

    pub fn from_kinds(kinds: &[FilterKind]) -> Self {
        kinds
            .iter()
            .cloned()
            .fold(Self::builder(), |builder, kind| builder.then(kind))
            .build()
    }

    /// Run the frame through every link in order. The first failing link
    /// aborts the chain for this frame.
    pub fn process(&self, frame: Frame) -> Result<Frame, FilterError> {
        self.links
            .iter()
            .try_fold(frame, |frame, link| link.apply(frame))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(Filter::name).collect()
    }
}

#[derive(Default)]
pub struct FilterChainBuilder {
    links: Vec<Filter>,
}

impl FilterChainBuilder {
    /// Wrap the chain built so far with `filter`.
    pub fn then(mut self, filter: impl Into<Filter>) -> Self {
        self.links.push(filter.into());
        self
    }

    pub fn build(self) -> FilterChain {
        FilterChain {
            links: self.links.into(),
        }
    }
}
