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

use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageFormat};
use pixfetch_error::{make_err, Code, Error, ResultExt};

/// Options forwarded to the decoder boundary.
#[derive(Clone, Debug)]
pub struct DecodeOptions {
    /// Display scale the decoded pixels represent. Affects the logical
    /// (point) size, never the pixel data.
    pub scale_factor: f32,

    /// Decode only the first frame of an animated source. Animated decoding
    /// itself lives behind the external decoder boundary; this engine
    /// always yields a single reference frame and records the policy.
    pub only_load_first_frame: bool,

    /// Ask the decoder to eagerly decode every animation frame rather than
    /// decoding lazily during playback.
    pub preload_all_animation_frames: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            scale_factor: 1.0,
            only_load_first_frame: false,
            preload_all_animation_frames: false,
        }
    }
}

/// A decoded image plus the display scale it was decoded at. Pixel data is
/// shared by cloning the underlying buffer; treat clones as cheap-but-not-
/// free and prefer passing `Arc<DecodedImage>` across component seams.
#[derive(Clone, Debug)]
pub struct DecodedImage {
    image: DynamicImage,
    scale: f32,
}

impl DecodedImage {
    pub fn from_dynamic(image: DynamicImage, scale: f32) -> Self {
        DecodedImage {
            image,
            scale: if scale > 0.0 { scale } else { 1.0 },
        }
    }

    /// Decodes `data` with the bundled codec set.
    pub fn decode(data: &[u8], options: &DecodeOptions) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(make_err!(Code::DecodeFailed, "Cannot decode an empty byte buffer"));
        }
        let image = image::load_from_memory(data).err_tip(|| "Failed to decode image data")?;
        Ok(DecodedImage::from_dynamic(image, options.scale_factor))
    }

    pub fn dynamic(&self) -> &DynamicImage {
        &self.image
    }

    /// Same scale, new pixels.
    pub fn with_dynamic(&self, image: DynamicImage) -> Self {
        DecodedImage {
            image,
            scale: self.scale,
        }
    }

    pub fn pixel_width(&self) -> u32 {
        self.image.width()
    }

    pub fn pixel_height(&self) -> u32 {
        self.image.height()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Logical size in points.
    pub fn point_size(&self) -> (f32, f32) {
        (
            self.pixel_width() as f32 / self.scale,
            self.pixel_height() as f32 / self.scale,
        )
    }

    /// Memory cost in bytes, the unit the memory store budgets by
    /// convention (RGBA8 footprint of the pixel grid).
    pub fn cost(&self) -> u64 {
        u64::from(self.pixel_width()) * u64::from(self.pixel_height()) * 4
    }

    /// Encodes the pixels into `format`. JPEG has no alpha channel, so the
    /// image is flattened to RGB first for that format.
    pub fn encode(&self, format: ImageFormat) -> Result<Bytes, Error> {
        let mut buffer = Cursor::new(Vec::new());
        if format == ImageFormat::Jpeg {
            DynamicImage::ImageRgb8(self.image.to_rgb8())
                .write_to(&mut buffer, format)
                .err_tip(|| "Failed to encode image as JPEG")?;
        } else {
            self.image
                .write_to(&mut buffer, format)
                .err_tip(|| format!("Failed to encode image as {format:?}"))?;
        }
        Ok(Bytes::from(buffer.into_inner()))
    }
}
