// Copyright 2024 The Pixfetch Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba};
use pixfetch_util::common::DEFAULT_PROCESSOR_IDENTIFIER;

use crate::decoded_image::{DecodeOptions, DecodedImage};

/// What a processor receives: the raw downloaded bytes on the first hop, an
/// already-decoded image on every later hop of a chain.
pub enum ProcessItem<'a> {
    Data(&'a Bytes),
    Image(&'a DecodedImage),
}

/// Options parameterising the decode step a processor may need to perform.
#[derive(Clone, Debug, Default)]
pub struct ProcessorContext {
    pub decode: DecodeOptions,
}

/// A pure transformation from bytes-or-image to image.
///
/// The identifier participates in cache fingerprints, so it must be a
/// deterministic function of the processor's parameters: two processors
/// with equal identifiers must produce identical output for identical
/// input. Returning `None` from `process` reports a processing failure.
pub trait ImageProcessor: Send + Sync {
    fn identifier(&self) -> &str;

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage>;

    /// Chains `other` after this processor. The free `append` function
    /// does the same for two already-erased processors.
    fn append(self, other: Arc<dyn ImageProcessor>) -> Arc<dyn ImageProcessor>
    where
        Self: Sized + 'static,
    {
        append(Arc::new(self), other)
    }
}

fn decode_item(item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
    match item {
        ProcessItem::Data(data) => DecodedImage::decode(data, &context.decode).ok(),
        ProcessItem::Image(image) => Some(image.clone()),
    }
}

/// Composes `first` then `second`. Composition is associative; identifiers
/// concatenate with `|>` so chains fingerprint distinctly from their parts.
pub fn append(
    first: Arc<dyn ImageProcessor>,
    second: Arc<dyn ImageProcessor>,
) -> Arc<dyn ImageProcessor> {
    let identifier = format!("{}|>{}", first.identifier(), second.identifier());
    Arc::new(ChainedProcessor {
        identifier,
        first,
        second,
    })
}

struct ChainedProcessor {
    identifier: String,
    first: Arc<dyn ImageProcessor>,
    second: Arc<dyn ImageProcessor>,
}

impl ImageProcessor for ChainedProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let intermediate = self.first.process(item, context)?;
        self.second.process(ProcessItem::Image(&intermediate), context)
    }
}

/// The identity element: decodes bytes, passes images through untouched.
/// Its identifier is the empty string, so original (unprocessed) entries
/// fingerprint under the bare cache key.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultProcessor;

impl ImageProcessor for DefaultProcessor {
    fn identifier(&self) -> &str {
        DEFAULT_PROCESSOR_IDENTIFIER
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        decode_item(item, context)
    }
}

/// Corner selection mask for [`RoundCornerProcessor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Corners(u8);

impl Corners {
    pub const TOP_LEFT: Corners = Corners(1);
    pub const TOP_RIGHT: Corners = Corners(2);
    pub const BOTTOM_LEFT: Corners = Corners(4);
    pub const BOTTOM_RIGHT: Corners = Corners(8);
    pub const ALL: Corners = Corners(15);

    pub fn union(self, other: Corners) -> Corners {
        Corners(self.0 | other.0)
    }

    pub fn contains(self, other: Corners) -> bool {
        self.0 & other.0 == other.0
    }

    fn bits(self) -> u8 {
        self.0
    }
}

/// Rounds the selected corners, optionally resizing to a target size first.
pub struct RoundCornerProcessor {
    radius: f32,
    target_size: Option<(u32, u32)>,
    corners: Corners,
    identifier: String,
}

impl RoundCornerProcessor {
    pub fn new(radius: f32) -> Self {
        Self::with_options(radius, None, Corners::ALL)
    }

    pub fn with_options(radius: f32, target_size: Option<(u32, u32)>, corners: Corners) -> Self {
        let size_part = match target_size {
            Some((w, h)) => format!("{w}x{h}"),
            None => "none".to_string(),
        };
        RoundCornerProcessor {
            identifier: format!(
                "pix.processor.round_corner(radius={radius},size={size_part},corners={})",
                corners.bits()
            ),
            radius,
            target_size,
            corners,
        }
    }
}

impl ImageProcessor for RoundCornerProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        let sized = match self.target_size {
            Some((w, h)) if w > 0 && h > 0 => {
                base.dynamic().resize_exact(w, h, FilterType::Lanczos3)
            }
            Some(_) => return None,
            None => base.dynamic().clone(),
        };
        let mut rgba = sized.to_rgba8();
        let (width, height) = rgba.dimensions();
        let radius = self
            .radius
            .min(width.min(height) as f32 / 2.0)
            .max(0.0);
        if radius > 0.0 {
            for (x, y, pixel) in rgba.enumerate_pixels_mut() {
                let fx = x as f32 + 0.5;
                let fy = y as f32 + 0.5;
                let outside = (self.corners.contains(Corners::TOP_LEFT)
                    && fx < radius
                    && fy < radius
                    && distance(fx, fy, radius, radius) > radius)
                    || (self.corners.contains(Corners::TOP_RIGHT)
                        && fx > width as f32 - radius
                        && fy < radius
                        && distance(fx, fy, width as f32 - radius, radius) > radius)
                    || (self.corners.contains(Corners::BOTTOM_LEFT)
                        && fx < radius
                        && fy > height as f32 - radius
                        && distance(fx, fy, radius, height as f32 - radius) > radius)
                    || (self.corners.contains(Corners::BOTTOM_RIGHT)
                        && fx > width as f32 - radius
                        && fy > height as f32 - radius
                        && distance(fx, fy, width as f32 - radius, height as f32 - radius)
                            > radius);
                if outside {
                    pixel.0[3] = 0;
                }
            }
        }
        Some(base.with_dynamic(DynamicImage::ImageRgba8(rgba)))
    }
}

fn distance(x: f32, y: f32, cx: f32, cy: f32) -> f32 {
    ((x - cx) * (x - cx) + (y - cy) * (y - cy)).sqrt()
}

/// How [`ResizeProcessor`] maps the source onto the reference size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentMode {
    /// Scale to fit inside the reference size, preserving aspect ratio.
    AspectFit,
    /// Scale to cover the reference size, preserving aspect ratio and
    /// cropping the overflow.
    AspectFill,
    /// Scale to exactly the reference size, ignoring aspect ratio.
    Resize,
}

impl ContentMode {
    fn tag(self) -> &'static str {
        match self {
            ContentMode::AspectFit => "fit",
            ContentMode::AspectFill => "fill",
            ContentMode::Resize => "resize",
        }
    }
}

pub struct ResizeProcessor {
    reference_size: (u32, u32),
    mode: ContentMode,
    identifier: String,
}

impl ResizeProcessor {
    pub fn new(reference_size: (u32, u32), mode: ContentMode) -> Self {
        ResizeProcessor {
            identifier: format!(
                "pix.processor.resize(size={}x{},mode={})",
                reference_size.0,
                reference_size.1,
                mode.tag()
            ),
            reference_size,
            mode,
        }
    }
}

impl ImageProcessor for ResizeProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        let (w, h) = self.reference_size;
        if w == 0 || h == 0 {
            return None;
        }
        let resized = match self.mode {
            ContentMode::AspectFit => base.dynamic().resize(w, h, FilterType::Lanczos3),
            ContentMode::AspectFill => base.dynamic().resize_to_fill(w, h, FilterType::Lanczos3),
            ContentMode::Resize => base.dynamic().resize_exact(w, h, FilterType::Lanczos3),
        };
        Some(base.with_dynamic(resized))
    }
}

/// Gaussian blur.
pub struct BlurProcessor {
    radius: f32,
    identifier: String,
}

impl BlurProcessor {
    pub fn new(radius: f32) -> Self {
        BlurProcessor {
            identifier: format!("pix.processor.blur(radius={radius})"),
            radius,
        }
    }
}

impl ImageProcessor for BlurProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        if self.radius <= 0.0 {
            return Some(base);
        }
        Some(base.with_dynamic(base.dynamic().blur(self.radius)))
    }
}

/// Blends a flat color over the image at the given strength.
pub struct OverlayProcessor {
    color: Rgba<u8>,
    fraction: f32,
    identifier: String,
}

impl OverlayProcessor {
    pub fn new(color: Rgba<u8>, fraction: f32) -> Self {
        let fraction = fraction.clamp(0.0, 1.0);
        OverlayProcessor {
            identifier: format!(
                "pix.processor.overlay(color={},fraction={fraction})",
                color_tag(color)
            ),
            color,
            fraction,
        }
    }
}

impl ImageProcessor for OverlayProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        let mut rgba = base.dynamic().to_rgba8();
        for pixel in rgba.pixels_mut() {
            for channel in 0..3 {
                pixel.0[channel] = blend(pixel.0[channel], self.color.0[channel], self.fraction);
            }
        }
        Some(base.with_dynamic(DynamicImage::ImageRgba8(rgba)))
    }
}

/// Composites a color over the image using the color's own alpha.
pub struct TintProcessor {
    color: Rgba<u8>,
    identifier: String,
}

impl TintProcessor {
    pub fn new(color: Rgba<u8>) -> Self {
        TintProcessor {
            identifier: format!("pix.processor.tint(color={})", color_tag(color)),
            color,
        }
    }
}

impl ImageProcessor for TintProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        let alpha = f32::from(self.color.0[3]) / 255.0;
        let mut rgba = base.dynamic().to_rgba8();
        for pixel in rgba.pixels_mut() {
            for channel in 0..3 {
                pixel.0[channel] = blend(pixel.0[channel], self.color.0[channel], alpha);
            }
        }
        Some(base.with_dynamic(DynamicImage::ImageRgba8(rgba)))
    }
}

/// Brightness / contrast / saturation / exposure adjustments, applied in
/// that order.
pub struct ColorControlsProcessor {
    brightness: f32,
    contrast: f32,
    saturation: f32,
    input_ev: f32,
    identifier: String,
}

impl ColorControlsProcessor {
    pub fn new(brightness: f32, contrast: f32, saturation: f32, input_ev: f32) -> Self {
        ColorControlsProcessor {
            identifier: format!(
                "pix.processor.color_controls(brightness={brightness},contrast={contrast},saturation={saturation},ev={input_ev})"
            ),
            brightness,
            contrast,
            saturation,
            input_ev,
        }
    }
}

impl ImageProcessor for ColorControlsProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        let exposure = 2f32.powf(self.input_ev);
        let mut rgba = base.dynamic().to_rgba8();
        for pixel in rgba.pixels_mut() {
            let mut channels = [
                f32::from(pixel.0[0]),
                f32::from(pixel.0[1]),
                f32::from(pixel.0[2]),
            ];
            for value in &mut channels {
                *value += self.brightness * 255.0;
                *value = (*value - 128.0) * self.contrast + 128.0;
            }
            let luma = 0.299 * channels[0] + 0.587 * channels[1] + 0.114 * channels[2];
            for (i, value) in channels.iter().enumerate() {
                let saturated = luma + (value - luma) * self.saturation;
                pixel.0[i] = (saturated * exposure).clamp(0.0, 255.0) as u8;
            }
        }
        Some(base.with_dynamic(DynamicImage::ImageRgba8(rgba)))
    }
}

/// Desaturates to grayscale.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlackWhiteProcessor;

impl ImageProcessor for BlackWhiteProcessor {
    fn identifier(&self) -> &str {
        "pix.processor.black_white"
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        Some(base.with_dynamic(DynamicImage::ImageLuma8(base.dynamic().to_luma8())))
    }
}

/// Crops a window of `size` positioned by a unit-square anchor
/// ((0,0) top-left, (0.5,0.5) center, (1,1) bottom-right).
pub struct CroppingProcessor {
    size: (u32, u32),
    anchor: (f32, f32),
    identifier: String,
}

impl CroppingProcessor {
    pub fn new(size: (u32, u32), anchor: (f32, f32)) -> Self {
        CroppingProcessor {
            identifier: format!(
                "pix.processor.crop(size={}x{},anchor={}x{})",
                size.0, size.1, anchor.0, anchor.1
            ),
            size,
            anchor,
        }
    }
}

impl ImageProcessor for CroppingProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        let (src_w, src_h) = (base.pixel_width(), base.pixel_height());
        let w = self.size.0.min(src_w);
        let h = self.size.1.min(src_h);
        if w == 0 || h == 0 {
            return None;
        }
        let anchor_x = self.anchor.0.clamp(0.0, 1.0);
        let anchor_y = self.anchor.1.clamp(0.0, 1.0);
        let x = ((src_w - w) as f32 * anchor_x).round() as u32;
        let y = ((src_h - h) as f32 * anchor_y).round() as u32;
        Some(base.with_dynamic(base.dynamic().crop_imm(x, y, w, h)))
    }
}

/// Scales down to a target point size at a display scale. Never upscales:
/// a target at least as large as the source passes the source through
/// unchanged. A zero-area target is a processing failure, not a panic.
pub struct DownsamplingProcessor {
    target_size: (u32, u32),
    scale: f32,
    identifier: String,
}

impl DownsamplingProcessor {
    pub fn new(target_size: (u32, u32), scale: f32) -> Self {
        let scale = if scale > 0.0 { scale } else { 1.0 };
        DownsamplingProcessor {
            identifier: format!(
                "pix.processor.downsampling(size={}x{},scale={scale})",
                target_size.0, target_size.1
            ),
            target_size,
            scale,
        }
    }
}

impl ImageProcessor for DownsamplingProcessor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn process(&self, item: ProcessItem, context: &ProcessorContext) -> Option<DecodedImage> {
        let base = decode_item(item, context)?;
        let target_w = (self.target_size.0 as f32 * self.scale) as u32;
        let target_h = (self.target_size.1 as f32 * self.scale) as u32;
        if target_w == 0 || target_h == 0 {
            return None;
        }
        if target_w >= base.pixel_width() && target_h >= base.pixel_height() {
            return Some(base);
        }
        Some(base.with_dynamic(base.dynamic().resize(target_w, target_h, FilterType::Triangle)))
    }
}

fn blend(src: u8, over: u8, fraction: f32) -> u8 {
    (f32::from(src) * (1.0 - fraction) + f32::from(over) * fraction).clamp(0.0, 255.0) as u8
}

fn color_tag(color: Rgba<u8>) -> String {
    format!(
        "#{:02x}{:02x}{:02x}{:02x}",
        color.0[0], color.0[1], color.0[2], color.0[3]
    )
}
