// Box blur and the blur-difference sharpness metric
//
// The blur is a separable (2r+1)^2 neighbourhood mean, iterated; three
// iterations approximate a Gaussian well enough for the quality metric.
// Out-of-image neighbours are edge-clamped. Sums are kept in u32: one
// pass accumulates at most 255*(2r+1)^2, which stays below 2^32 for
// r < 2^11 because the result is divided back to u8 after every
// iteration.

use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat};

pub const QUALITY_BOX_BLUR_ITERATIONS: u32 = 3;

const MAX_BLUR_RADIUS: u32 = 1 << 11;

pub fn box_blur(img: &Image, radius: u32, iterations: u32) -> Result<Image> {
  if img.pix_fmt() != PixelFormat::Mono8 {
    return Err(Error::UnsupportedPixelFormat(img.pix_fmt()));
  }
  if radius == 0 || radius >= MAX_BLUR_RADIUS {
    return Err(Error::InvalidParameters("blur radius must be in 1..2^11"));
  }

  let width = img.width() as usize;
  let height = img.height() as usize;
  let r = radius as isize;
  let window = 2 * radius as u32 + 1;
  let area = (window * window) as u32;

  let mut src: Vec<u8> = img.pixels().to_vec();
  let mut row_sums = vec![0u32; width * height];
  let mut dest = vec![0u8; width * height];

  for _ in 0..iterations {
    // Horizontal pass: moving window sum per row, edge-clamped
    for y in 0..height {
      let line = &src[y * width .. (y + 1) * width];
      let clamped = |x: isize| line[x.clamp(0, width as isize - 1) as usize] as u32;

      let mut sum = 0u32;
      for i in -r ..= r {
        sum += clamped(i);
      }
      for x in 0..width {
        row_sums[y * width + x] = sum;
        sum += clamped(x as isize + r + 1);
        sum -= clamped(x as isize - r);
      }
    }

    // Vertical pass over the row sums, then divide back to u8
    for x in 0..width {
      let clamped = |y: isize| row_sums[y.clamp(0, height as isize - 1) as usize * width + x];

      let mut sum = 0u32;
      for i in -r ..= r {
        sum += clamped(i);
      }
      for y in 0..height {
        dest[y * width + x] = (sum / area) as u8;
        sum += clamped(y as isize + r + 1);
        sum -= clamped(y as isize - r);
      }
    }

    std::mem::swap(&mut src, &mut dest);
  }

  Image::from_pixels(img.width(), img.height(), PixelFormat::Mono8, None, src)
}

// Sharpness of a Mono8 image: mean absolute difference between the image
// and its blurred copy. Zero for perfectly smooth input, growing with
// fine detail.
pub fn estimate_quality(img: &Image, detail_radius: u32) -> Result<f32> {
  let blurred = box_blur(img, detail_radius, QUALITY_BOX_BLUR_ITERATIONS)?;
  let mut sum = 0u64;
  for (&a, &b) in img.pixels().iter().zip(blurred.pixels().iter()) {
    sum += (a as i32 - b as i32).unsigned_abs() as u64;
  }
  Ok(sum as f32 / (img.width() as f32 * img.height() as f32))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn constant(width: u32, height: u32, value: u8) -> Image {
    let data = vec![value; (width * height) as usize];
    Image::from_pixels(width, height, PixelFormat::Mono8, None, data).unwrap()
  }

  fn checkerboard(width: u32, height: u32) -> Image {
    let mut img = Image::new(width, height, PixelFormat::Mono8, None).unwrap();
    for y in 0..height {
      for x in 0..width {
        img.line_mut(y)[x as usize] = if (x + y) % 2 == 0 { 255 } else { 0 };
      }
    }
    return img;
  }

  #[test]
  fn blur_keeps_constant_images_constant() {
    let img = constant(20, 15, 77);
    let blurred = box_blur(&img, 3, 3).unwrap();
    assert!(blurred.pixels().iter().all(|&v| v == 77));
  }

  #[test]
  fn checkerboard_blurs_to_half_level() {
    let img = checkerboard(32, 32);
    let blurred = box_blur(&img, 2, 1).unwrap();
    // Window holds 13 or 12 of 25 bright pixels: 255*13/25 or 255*12/25
    for y in 4..28u32 {
      for x in 4..28usize {
        let v = blurred.line(y)[x];
        assert!(v == 122 || v == 132, "value {} at ({}, {})", v, x, y);
      }
    }
  }

  #[test]
  fn quality_of_constant_image_is_zero() {
    let img = constant(16, 16, 128);
    assert_eq!(estimate_quality(&img, 2).unwrap(), 0.0);
  }

  #[test]
  fn quality_grows_with_detail() {
    let sharp = checkerboard(24, 24);
    let smooth = box_blur(&sharp, 2, 3).unwrap();
    let q_sharp = estimate_quality(&sharp, 2).unwrap();
    let q_smooth = estimate_quality(&smooth, 2).unwrap();
    assert!(q_sharp > q_smooth);
    assert!(q_smooth >= 0.0);
  }

  #[test]
  fn radius_bounds_are_enforced() {
    let img = constant(8, 8, 1);
    assert!(box_blur(&img, 0, 1).is_err());
    assert!(box_blur(&img, 1 << 11, 1).is_err());
  }
}
