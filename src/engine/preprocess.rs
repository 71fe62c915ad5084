//! Image preprocessing for the cascade networks
//!
//! Frames and face crops are resized to the network input and written as
//! planar BGR f32 (0..255, no normalization) into one batch slot.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{ArrayViewMut4, Axis};

use crate::backend::TensorViewMut;
use crate::error::{CascadeError, Result};

use super::detector::BoundingBox;

/// Write `image` into batch slot `slot` of an NCHW input tensor
pub fn write_slot(stage: &'static str, image: &RgbImage, input: TensorViewMut<'_>, slot: usize) -> Result<()> {
    let TensorViewMut { dims, data } = input;
    let &[batch, channels, height, width] = dims else {
        return Err(CascadeError::contract(
            stage,
            format!("input should be NCHW, got dims {:?}", dims),
        ));
    };
    if channels != 3 {
        return Err(CascadeError::contract(
            stage,
            format!("input should have 3 channels, got {}", channels),
        ));
    }
    if slot >= batch {
        return Err(CascadeError::IndexOutOfRange {
            stage,
            index: slot,
            len: batch,
        });
    }

    let total = batch * channels * height * width;
    let available = data.len();
    let data = data.get_mut(..total).ok_or_else(|| {
        CascadeError::contract(
            stage,
            format!("input buffer holds {} values, dims need {}", available, total),
        )
    })?;
    let mut blob = ArrayViewMut4::from_shape((batch, channels, height, width), data)
        .map_err(|e| CascadeError::contract(stage, e.to_string()))?;
    let mut target = blob.index_axis_mut(Axis(0), slot);

    let resized;
    let source = if image.dimensions() == (width as u32, height as u32) {
        image
    } else {
        resized = imageops::resize(image, width as u32, height as u32, FilterType::Triangle);
        &resized
    };

    for (x, y, pixel) in source.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        // Networks expect BGR order.
        target[[0, y, x]] = pixel[2] as f32;
        target[[1, y, x]] = pixel[1] as f32;
        target[[2, y, x]] = pixel[0] as f32;
    }

    Ok(())
}

/// Cut a face region out of a frame, clamping the box to the frame
///
/// The crop is at least 1x1, so every detection yields an input for the
/// secondary stages. Returns `None` only for an empty frame.
pub fn crop_face(frame: &RgbImage, location: &BoundingBox) -> Option<RgbImage> {
    let (img_w, img_h) = (frame.width() as i64, frame.height() as i64);
    if img_w == 0 || img_h == 0 {
        return None;
    }

    let x1 = (location.x as i64).clamp(0, img_w - 1);
    let y1 = (location.y as i64).clamp(0, img_h - 1);
    let x2 = (location.x as i64 + location.width as i64).clamp(x1 + 1, img_w);
    let y2 = (location.y as i64 + location.height as i64).clamp(y1 + 1, img_h);

    Some(imageops::crop_imm(frame, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn location(x: i32, y: i32, width: i32, height: i32) -> BoundingBox {
        BoundingBox { x, y, width, height }
    }

    #[test]
    fn test_write_slot_bgr_planar() {
        let dims = [2usize, 3, 2, 2];
        let mut data = vec![0.0f32; 2 * 3 * 2 * 2];
        let image = RgbImage::from_pixel(2, 2, Rgb([10, 20, 30]));

        write_slot("test", &image, TensorViewMut { dims: &dims, data: &mut data }, 1).unwrap();

        // Slot 0 untouched.
        assert!(data[..12].iter().all(|&v| v == 0.0));
        assert_eq!(&data[12..16], &[30.0; 4]);
        assert_eq!(&data[16..20], &[20.0; 4]);
        assert_eq!(&data[20..24], &[10.0; 4]);
    }

    #[test]
    fn test_write_slot_resizes() {
        let dims = [1usize, 3, 4, 4];
        let mut data = vec![0.0f32; 48];
        let image = RgbImage::from_pixel(17, 9, Rgb([200, 100, 50]));

        write_slot("test", &image, TensorViewMut { dims: &dims, data: &mut data }, 0).unwrap();

        assert!(data[..16].iter().all(|&v| (v - 50.0).abs() < 1.0));
        assert!(data[32..].iter().all(|&v| (v - 200.0).abs() < 1.0));
    }

    #[test]
    fn test_write_slot_out_of_range() {
        let dims = [1usize, 3, 2, 2];
        let mut data = vec![0.0f32; 12];
        let image = RgbImage::new(2, 2);
        let err = write_slot("test", &image, TensorViewMut { dims: &dims, data: &mut data }, 1).unwrap_err();
        assert!(matches!(err, CascadeError::IndexOutOfRange { index: 1, len: 1, .. }));
    }

    #[test]
    fn test_write_slot_requires_three_channels() {
        let dims = [1usize, 1, 2, 2];
        let mut data = vec![0.0f32; 4];
        let image = RgbImage::new(2, 2);
        let err = write_slot("test", &image, TensorViewMut { dims: &dims, data: &mut data }, 0).unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_crop_inside_frame() {
        let frame = RgbImage::new(100, 80);
        let crop = crop_face(&frame, &location(10, 20, 30, 40)).unwrap();
        assert_eq!(crop.dimensions(), (30, 40));
    }

    #[test]
    fn test_crop_clamped_to_frame() {
        let frame = RgbImage::new(100, 80);
        let crop = crop_face(&frame, &location(-20, -45, 140, 140)).unwrap();
        assert_eq!(crop.dimensions(), (100, 80));

        let crop = crop_face(&frame, &location(90, 70, 40, 40)).unwrap();
        assert_eq!(crop.dimensions(), (10, 10));
    }

    #[test]
    fn test_crop_outside_frame_is_one_pixel() {
        let frame = RgbImage::new(100, 80);
        let crop = crop_face(&frame, &location(150, 150, 10, 10)).unwrap();
        assert_eq!(crop.dimensions(), (1, 1));
        assert!(crop_face(&RgbImage::new(0, 0), &location(0, 0, 10, 10)).is_none());
    }
}
