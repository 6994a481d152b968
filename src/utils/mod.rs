use image::{ImageBuffer, Rgb, RgbImage};

/// Maps `[-1, 1]` to `[0, 1]`.
pub fn to_unit_range(value: f32) -> f32 {
    (value + 1.0) / 2.0
}

/// Converts planar CHW RGB data in `[0, 1]` to an 8-bit image.
pub fn chw_unit_to_image(data: &[f32], height: usize, width: usize) -> Option<RgbImage> {
    let plane = height * width;
    if data.len() != 3 * plane {
        tracing::warn!(
            expected = 3 * plane,
            actual = data.len(),
            "mismatched planar image length"
        );
        return None;
    }

    let mut raw_pixels = Vec::with_capacity(3 * plane);
    for index in 0..plane {
        for channel in 0..3 {
            let value = data[channel * plane + index] * 255.0;
            raw_pixels.push(value.clamp(0.0, 255.0) as u8);
        }
    }

    ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width as u32, height as u32, raw_pixels)
}
