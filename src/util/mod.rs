use image::{
    EncodableLayout, GenericImage, GenericImageView, GrayImage, ImageBuffer, Pixel,
    PixelWithColorType, Rgb, RgbImage,
};
use log::info;
use nalgebra::Vector2;
use std::fs;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ensure `dir` exists.
pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> Result<(), UtilError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Loads any supported image file as 8-bit grayscale.
pub fn load_gray_image<P: AsRef<Path>>(path: P) -> Result<GrayImage, UtilError> {
    Ok(image::open(path.as_ref())?.to_luma8())
}

/// Saves an image, creating the parent directory first.
pub fn save_image<Px, Q>(image: &ImageBuffer<Px, Vec<Px::Subpixel>>, path: Q) -> Result<(), UtilError>
where
    Px: Pixel + PixelWithColorType,
    [Px::Subpixel]: EncodableLayout,
    Q: AsRef<Path>,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    image.save(path)?;
    info!("Saved image: {}", path.display());
    Ok(())
}

/// Splits a side-by-side frame into its left and right halves.
///
/// # Errors
///
/// [`UtilError::InvalidParams`] if the width is odd or zero.
pub fn split_side_by_side(frame: &GrayImage) -> Result<(GrayImage, GrayImage), UtilError> {
    let (width, height) = frame.dimensions();
    if width == 0 || width % 2 != 0 {
        return Err(UtilError::InvalidParams(format!(
            "side-by-side frame must have an even, non-zero width, got {width}"
        )));
    }
    let half = width / 2;
    let left = frame.view(0, 0, half, height).to_image();
    let right = frame.view(half, 0, half, height).to_image();
    Ok((left, right))
}

/// Places two images of equal height next to each other.
pub fn concat_horizontal(left: &RgbImage, right: &RgbImage) -> Result<RgbImage, UtilError> {
    if left.height() != right.height() {
        return Err(UtilError::InvalidParams(format!(
            "image heights differ: {} vs {}",
            left.height(),
            right.height()
        )));
    }
    let mut out = RgbImage::new(left.width() + right.width(), left.height());
    out.copy_from(left, 0, 0)
        .map_err(|e| UtilError::InvalidParams(format!("Failed to copy left image: {e}")))?;
    out.copy_from(right, left.width(), 0)
        .map_err(|e| UtilError::InvalidParams(format!("Failed to copy right image: {e}")))?;
    Ok(out)
}

/// Draws a filled circle, clipped to the image.
pub fn draw_circle(img: &mut RgbImage, center: &Vector2<f64>, radius: i32, color: Rgb<u8>) {
    let center_x = center.x.round() as i32;
    let center_y = center.y.round() as i32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                let x = center_x + dx;
                let y = center_y + dy;
                if x >= 0 && x < img.width() as i32 && y >= 0 && y < img.height() as i32 {
                    img.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
}

/// Draws a one pixel wide line, clipped to the image.
pub fn draw_line(img: &mut RgbImage, from: &Vector2<f64>, to: &Vector2<f64>, color: Rgb<u8>) {
    let steps = (to - from).abs().max().ceil().max(1.0) as usize;
    for i in 0..=steps {
        let p = from + (to - from) * (i as f64 / steps as f64);
        let x = p.x.round() as i32;
        let y = p.y.round() as i32;
        if x >= 0 && x < img.width() as i32 && y >= 0 && y < img.height() as i32 {
            img.put_pixel(x as u32, y as u32, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_split_side_by_side() {
        let frame = GrayImage::from_fn(8, 3, |x, _| Luma([if x < 4 { 10 } else { 200 }]));
        let (left, right) = split_side_by_side(&frame).unwrap();
        assert_eq!(left.dimensions(), (4, 3));
        assert_eq!(right.dimensions(), (4, 3));
        assert!(left.pixels().all(|p| p[0] == 10));
        assert!(right.pixels().all(|p| p[0] == 200));

        let odd = GrayImage::new(7, 3);
        assert!(split_side_by_side(&odd).is_err());
    }

    #[test]
    fn test_drawing_is_clipped() {
        let mut img = RgbImage::new(10, 10);
        draw_circle(&mut img, &Vector2::new(0.0, 0.0), 2, Rgb([255, 0, 0]));
        draw_line(
            &mut img,
            &Vector2::new(-5.0, 5.0),
            &Vector2::new(20.0, 5.0),
            Rgb([0, 255, 0]),
        );
        assert_eq!(*img.get_pixel(0, 0), Rgb([255, 0, 0]));
        assert!((0..10).all(|x| *img.get_pixel(x, 5) == Rgb([0, 255, 0])));
    }

    #[test]
    fn test_concat_horizontal() {
        let a = RgbImage::from_pixel(3, 2, Rgb([1, 2, 3]));
        let b = RgbImage::from_pixel(4, 2, Rgb([4, 5, 6]));
        let joined = concat_horizontal(&a, &b).unwrap();
        assert_eq!(joined.dimensions(), (7, 2));
        assert_eq!(*joined.get_pixel(3, 1), Rgb([4, 5, 6]));
        assert!(concat_horizontal(&a, &RgbImage::new(2, 5)).is_err());
    }
}
