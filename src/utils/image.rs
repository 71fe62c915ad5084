//! Image utility functions

use std::path::Path;

use anyhow::{Context, Result};
use image::RgbImage;

/// Read an image file (JPEG, PNG, etc.) as an RGB frame
pub fn load_frame(path: &Path) -> Result<RgbImage> {
    let img = image::open(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(img.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_load_frame_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(4, 3, Rgb([1, 2, 3])).save(&path).unwrap();

        let frame = load_frame(&path).unwrap();
        assert_eq!(frame.dimensions(), (4, 3));
        assert_eq!(frame.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_missing_file() {
        let err = load_frame(Path::new("does/not/exist.png")).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.png"));
    }

    #[test]
    fn test_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(load_frame(&path).is_err());
    }
}
