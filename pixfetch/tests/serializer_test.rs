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
use image::{DynamicImage, ImageFormat};
use pixfetch::decoded_image::{DecodeOptions, DecodedImage};
use pixfetch::serializer::{CacheSerializer, FormatSerializer};

fn test_image(width: u32, height: u32) -> DecodedImage {
    DecodedImage::from_dynamic(DynamicImage::new_rgba8(width, height), 1.0)
}

#[cfg(test)]
mod serializer_tests {
    use super::*;
    use pretty_assertions::assert_eq; // Must be declared in every module.

    #[test]
    fn passes_original_bytes_through_when_no_format_is_pinned() {
        let image = test_image(4, 4);
        let original = Bytes::from(image.encode(ImageFormat::Png).unwrap());

        let data = FormatSerializer::new().data(&image, Some(&original)).unwrap();
        assert_eq!(data, original, "No pinned format means no re-encode");
    }

    #[test]
    fn keeps_original_bytes_when_they_already_carry_the_pinned_format() {
        let image = test_image(4, 4);
        let original = Bytes::from(image.encode(ImageFormat::Png).unwrap());

        let serializer = FormatSerializer::with_format(ImageFormat::Png);
        let data = serializer.data(&image, Some(&original)).unwrap();
        assert_eq!(data, original, "A format-matching original must not be re-encoded");
    }

    #[test]
    fn re_encodes_when_the_original_format_differs() {
        let image = test_image(4, 4);
        let original = Bytes::from(image.encode(ImageFormat::Png).unwrap());

        let serializer = FormatSerializer::with_format(ImageFormat::Jpeg);
        let data = serializer.data(&image, Some(&original)).unwrap();
        assert_eq!(
            image::guess_format(&data).unwrap(),
            ImageFormat::Jpeg,
            "A mismatched original must be re-encoded into the pinned format"
        );
    }

    #[test]
    fn synthesized_variants_fall_back_to_png() {
        let image = test_image(3, 5);
        let data = FormatSerializer::new().data(&image, None).unwrap();
        assert_eq!(image::guess_format(&data).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn persisted_bytes_round_trip_back_to_an_image() {
        let image = test_image(6, 2);
        let serializer = FormatSerializer::new();
        let data = serializer.data(&image, None).unwrap();

        let rebuilt = serializer.image(&data, &DecodeOptions::default()).unwrap();
        assert_eq!(
            (rebuilt.pixel_width(), rebuilt.pixel_height()),
            (6, 2),
            "Expected the persisted entry to rebuild at its stored dimensions"
        );
    }
}
