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

use bytes::Bytes;
use image::ImageFormat;
use pixfetch_error::{Code, Error, ResultExt};

use crate::decoded_image::{DecodeOptions, DecodedImage};

/// Codec between an in-memory image and the byte form written to disk.
pub trait CacheSerializer: Send + Sync {
    /// The bytes to persist for `image`. `original` carries the bytes the
    /// image was decoded from, when the pipeline still has them.
    fn data(&self, image: &DecodedImage, original: Option<&Bytes>) -> Result<Bytes, Error>;

    /// Rebuilds an image from persisted bytes.
    fn image(&self, data: &Bytes, options: &DecodeOptions) -> Result<DecodedImage, Error>;

    /// Extension hint for the disk store's file naming, without the dot.
    fn file_extension(&self) -> Option<&str> {
        None
    }
}

/// The stock serializer. Without a pinned format it persists the original
/// download bytes whenever they are available (no re-encode cost, format
/// preserved) and falls back to PNG for synthesized variants. With a pinned
/// format every write re-encodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct FormatSerializer {
    format: Option<ImageFormat>,
}

impl FormatSerializer {
    pub fn new() -> Self {
        FormatSerializer { format: None }
    }

    pub fn with_format(format: ImageFormat) -> Self {
        FormatSerializer {
            format: Some(format),
        }
    }
}

impl CacheSerializer for FormatSerializer {
    fn data(&self, image: &DecodedImage, original: Option<&Bytes>) -> Result<Bytes, Error> {
        let result = match (self.format, original) {
            (None, Some(original)) => return Ok(original.clone()),
            // A pinned format that the original bytes already carry needs
            // no re-encode either.
            (Some(format), Some(original))
                if image::guess_format(original).ok() == Some(format) =>
            {
                return Ok(original.clone())
            }
            (None, None) => image.encode(ImageFormat::Png),
            (Some(format), _) => image.encode(format),
        };
        result.err_tip_with_code(|_| (Code::CannotSerializeImage, "While serializing image for disk"))
    }

    fn image(&self, data: &Bytes, options: &DecodeOptions) -> Result<DecodedImage, Error> {
        DecodedImage::decode(data, options)
    }

    fn file_extension(&self) -> Option<&str> {
        match self.format {
            Some(ImageFormat::Png) => Some("png"),
            Some(ImageFormat::Jpeg) => Some("jpg"),
            Some(ImageFormat::Gif) => Some("gif"),
            Some(ImageFormat::Bmp) => Some("bmp"),
            Some(ImageFormat::Tiff) => Some("tiff"),
            Some(ImageFormat::WebP) => Some("webp"),
            _ => None,
        }
    }
}
