// Bayer-mosaic reconstruction
//
// Two methods per bit depth:
//  - Simple: box/bilinear interpolation from the nearest same-color
//    neighbours, divisions by powers of two only
//  - HqLinear: the Malvar-He-Cutler gradient-corrected linear filter,
//    fixed integer 5x5 kernels, output clamped to [0, max]
//
// Both walk 2x2 blocks starting at (2, 2); the kernels reach at most 2
// pixels out, so the untouched border (exactly 2 pixels at the top/left,
// exactly 3 at the right/bottom) is replicated from the nearest
// reconstructed pixel.

use crate::error::Result;
use crate::image::{Image, PixelFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfaPattern {
  Rggb,
  Grbg,
  Gbrg,
  Bggr
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DemosaicMethod {
  Simple,
  #[default]
  HqLinear
}

// Pattern seen when the mosaic origin moves by (dx, dy); dx and dy are
// taken modulo 2. Shifting twice by the same parity restores the input.
pub fn translate_pattern(base: CfaPattern, dx: usize, dy: usize) -> CfaPattern {
  use CfaPattern::*;
  match (base, dx & 1, dy & 1) {
    (p, 0, 0) => p,
    (Rggb, 1, 0) => Grbg,
    (Rggb, 0, 1) => Gbrg,
    (Rggb, 1, 1) => Bggr,
    (Grbg, 1, 0) => Rggb,
    (Grbg, 0, 1) => Bggr,
    (Grbg, 1, 1) => Gbrg,
    (Gbrg, 1, 0) => Bggr,
    (Gbrg, 0, 1) => Rggb,
    (Gbrg, 1, 1) => Grbg,
    (Bggr, 1, 0) => Gbrg,
    (Bggr, 0, 1) => Grbg,
    (Bggr, 1, 1) => Rggb,
    _ => unreachable!()
  }
}

// Column and row parity of the red sample within the 2x2 tile
fn red_position(pattern: CfaPattern) -> (usize, usize) {
  match pattern {
    CfaPattern::Rggb => (0, 0),
    CfaPattern::Grbg => (1, 0),
    CfaPattern::Gbrg => (0, 1),
    CfaPattern::Bggr => (1, 1)
  }
}

pub fn demosaic_to_rgb(img: &Image, method: DemosaicMethod) -> Result<Image> {
  let bits = img.pix_fmt().bits_per_channel();
  let dest_fmt = if bits == 8 { PixelFormat::Rgb8 } else { PixelFormat::Rgb16 };
  let planes = reconstruct(img, method);

  let width = img.width();
  let height = img.height();
  let mut out = Image::new(width, height, dest_fmt, None)?;
  for y in 0..height {
    let line = out.line_mut(y);
    for x in 0..width as usize {
      let [r, g, b] = planes[y as usize * width as usize + x];
      if bits == 8 {
        line[3*x] = r as u8;
        line[3*x + 1] = g as u8;
        line[3*x + 2] = b as u8;
      } else {
        line[6*x .. 6*x + 2].copy_from_slice(&(r as u16).to_ne_bytes());
        line[6*x + 2 .. 6*x + 4].copy_from_slice(&(g as u16).to_ne_bytes());
        line[6*x + 4 .. 6*x + 6].copy_from_slice(&(b as u16).to_ne_bytes());
      }
    }
  }
  return Ok(out);
}

pub fn demosaic_to_mono8(img: &Image, method: DemosaicMethod) -> Result<Image> {
  let bits = img.pix_fmt().bits_per_channel();
  let shift = bits - 8;
  let planes = reconstruct(img, method);

  let width = img.width();
  let height = img.height();
  let mut out = Image::new(width, height, PixelFormat::Mono8, None)?;
  for y in 0..height {
    let line = out.line_mut(y);
    for x in 0..width as usize {
      let [r, g, b] = planes[y as usize * width as usize + x];
      line[x] = (((r + g + b) / 3) >> shift) as u8;
    }
  }
  return Ok(out);
}

// Reconstruct full RGB for every pixel, as raw-range i32 values
fn reconstruct(img: &Image, method: DemosaicMethod) -> Vec<[i32; 3]> {
  debug_assert!(img.pix_fmt().is_cfa());
  let width = img.width() as usize;
  let height = img.height() as usize;
  let bits = img.pix_fmt().bits_per_channel();
  let max_value = ((1u32 << bits) - 1) as i32;
  let pattern = img.pix_fmt().cfa_pattern().unwrap();

  let raw = load_plane(img);
  let mut out = vec![[0i32; 3]; width * height];

  // Too small for the kernels: treat the mosaic as grayscale
  if width < 6 || height < 6 {
    for i in 0..raw.len() {
      out[i] = [raw[i], raw[i], raw[i]];
    }
    return out;
  }

  let (red_x, red_y) = red_position(pattern);
  // The reconstructed interior runs from (2, 2) to (width-4, height-4)
  // inclusive, leaving the 2-pixel top/left and 3-pixel right/bottom
  // border regardless of dimension parity. On even dimensions the last
  // 2x2 block straddles the interior edge; its outside writes are
  // clipped. The kernels reach 2 pixels out, so width-4 + 2 stays in
  // bounds.
  let last_x = width - 4;
  let last_y = height - 4;

  let mut by = 2;
  while by <= last_y {
    let mut bx = 2;
    while bx <= last_x {
      for y in by .. (by + 2).min(last_y + 1) {
        for x in bx .. (bx + 2).min(last_x + 1) {
          out[y * width + x] = match method {
            DemosaicMethod::Simple => simple_at(&raw, width, x, y, red_x, red_y),
            DemosaicMethod::HqLinear => hq_at(&raw, width, x, y, red_x, red_y, max_value)
          };
        }
      }
      bx += 2;
    }
    by += 2;
  }

  // Replicate the reconstructed interior into the border
  for y in 0..height {
    for x in 0..width {
      if y >= 2 && y <= last_y && x >= 2 && x <= last_x {
        continue;
      }
      let sy = y.clamp(2, last_y);
      let sx = x.clamp(2, last_x);
      out[y * width + x] = out[sy * width + sx];
    }
  }
  return out;
}

fn load_plane(img: &Image) -> Vec<i32> {
  let width = img.width() as usize;
  let height = img.height() as usize;
  let mut raw = Vec::with_capacity(width * height);
  if img.pix_fmt().bits_per_channel() == 8 {
    for y in 0..height as u32 {
      raw.extend(img.line(y).iter().map(|&v| v as i32));
    }
  } else {
    for y in 0..height as u32 {
      let line = img.line(y);
      for x in 0..width {
        raw.push(u16::from_ne_bytes(line[2*x .. 2*x + 2].try_into().unwrap()) as i32);
      }
    }
  }
  return raw;
}

// Bilinear reconstruction at (x, y); all neighbours are at distance <= 1
// so calls are only made at least 1 pixel inside the image
fn simple_at(raw: &[i32], width: usize, x: usize, y: usize,
             red_x: usize, red_y: usize) -> [i32; 3] {
  let at = |dx: isize, dy: isize| -> i32 {
    raw[(y as isize + dy) as usize * width + (x as isize + dx) as usize]
  };
  let v = at(0, 0);
  let cross = (at(-1, 0) + at(1, 0) + at(0, -1) + at(0, 1)) / 4;
  let diag = (at(-1, -1) + at(1, -1) + at(-1, 1) + at(1, 1)) / 4;
  let horz = (at(-1, 0) + at(1, 0)) / 2;
  let vert = (at(0, -1) + at(0, 1)) / 2;

  let on_red_col = (x & 1) == red_x;
  let on_red_row = (y & 1) == red_y;
  match (on_red_col, on_red_row) {
    (true, true) => [v, cross, diag],          // red site
    (false, false) => [diag, cross, v],        // blue site
    (false, true) => [horz, v, vert],          // green, red row
    (true, false) => [vert, v, horz]           // green, blue row
  }
}

// Gradient-corrected linear reconstruction at (x, y); kernels reach 2
// pixels out
fn hq_at(raw: &[i32], width: usize, x: usize, y: usize,
         red_x: usize, red_y: usize, max_value: i32) -> [i32; 3] {
  let at = |dx: isize, dy: isize| -> i32 {
    raw[(y as isize + dy) as usize * width + (x as isize + dx) as usize]
  };
  let v = at(0, 0);
  let cross1 = at(-1, 0) + at(1, 0) + at(0, -1) + at(0, 1);
  let diag1 = at(-1, -1) + at(1, -1) + at(-1, 1) + at(1, 1);
  let horz1 = at(-1, 0) + at(1, 0);
  let vert1 = at(0, -1) + at(0, 1);
  let horz2 = at(-2, 0) + at(2, 0);
  let vert2 = at(0, -2) + at(0, 2);
  let axial2 = horz2 + vert2;

  let clamp = |val: i32| val.clamp(0, max_value);

  // At a red or blue site: same-plane value kept, green from the
  // 4-neighbour cross, the opposite color from the diagonals
  let green_here = |center: i32| clamp((4*center + 2*cross1 - axial2) / 8);
  let opposite_here = |center: i32| clamp((12*center + 4*diag1 - 3*axial2) / 16);

  // At a green site: the neighbouring color along its own axis
  let along = |axis1: i32, axis2: i32, other2: i32| {
    clamp((10*v + 8*axis1 - 2*axis2 - 2*diag1 + other2) / 16)
  };

  let on_red_col = (x & 1) == red_x;
  let on_red_row = (y & 1) == red_y;
  match (on_red_col, on_red_row) {
    (true, true) => [v, green_here(v), opposite_here(v)],
    (false, false) => [opposite_here(v), green_here(v), v],
    (false, true) => {
      // green pixel with red neighbours left/right, blue above/below
      let r = along(horz1, horz2, vert2);
      let b = along(vert1, vert2, horz2);
      [r, v, b]
    },
    (true, false) => {
      // green pixel with blue neighbours left/right, red above/below
      let r = along(vert1, vert2, horz2);
      let b = along(horz1, horz2, vert2);
      [r, v, b]
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::cfa_format;

  // Fill a mosaic so that every red site reads `r`, green site `g`,
  // blue site `b`
  fn make_cfa(width: u32, height: u32, pattern: CfaPattern, bits: usize,
              r: u32, g: u32, b: u32) -> Image {
    let mut img = Image::new(width, height, cfa_format(pattern, bits), None).unwrap();
    let (red_x, red_y) = red_position(pattern);
    for y in 0..height {
      let line = img.line_mut(y);
      for x in 0..width {
        let on_red_col = (x as usize & 1) == red_x;
        let on_red_row = (y as usize & 1) == red_y;
        let v = match (on_red_col, on_red_row) {
          (true, true) => r,
          (false, false) => b,
          _ => g
        };
        if bits == 8 {
          line[x as usize] = v as u8;
        } else {
          line[2*x as usize .. 2*x as usize + 2].copy_from_slice(&(v as u16).to_ne_bytes());
        }
      }
    }
    return img;
  }

  #[test]
  fn pattern_translation_round_trips() {
    use CfaPattern::*;
    for p in [Rggb, Grbg, Gbrg, Bggr] {
      for dx in 0..2 {
        for dy in 0..2 {
          assert_eq!(translate_pattern(translate_pattern(p, dx, dy), dx, dy), p);
        }
      }
    }
  }

  #[test]
  fn constant_channels_reconstruct_exactly() {
    for method in [DemosaicMethod::Simple, DemosaicMethod::HqLinear] {
      for pattern in [CfaPattern::Rggb, CfaPattern::Grbg, CfaPattern::Gbrg, CfaPattern::Bggr] {
        let img = make_cfa(16, 12, pattern, 8, 100, 50, 25);
        let rgb = demosaic_to_rgb(&img, method).unwrap();
        assert_eq!(rgb.pix_fmt(), PixelFormat::Rgb8);
        for y in 0..12 {
          let line = rgb.line(y);
          for x in 0..16usize {
            assert_eq!(&line[3*x .. 3*x + 3], [100, 50, 25],
                       "{:?} {:?} at ({}, {})", method, pattern, x, y);
          }
        }
      }
    }
  }

  // Raw values vary with position, so reconstructed and replicated
  // pixels differ and the border extent becomes observable
  fn ramp_cfa(width: u32, height: u32) -> Image {
    let mut img = Image::new(width, height, cfa_format(CfaPattern::Rggb, 8), None).unwrap();
    for y in 0..height {
      let line = img.line_mut(y);
      for x in 0..width {
        line[x as usize] = (10 * x + 3 * y) as u8;
      }
    }
    return img;
  }

  #[test]
  fn border_replication_covers_exactly_2_and_3_pixels() {
    for (width, height) in [(16u32, 12u32), (15, 13)] {
      for method in [DemosaicMethod::Simple, DemosaicMethod::HqLinear] {
        let rgb = demosaic_to_rgb(&ramp_cfa(width, height), method).unwrap();
        let px = |x: u32, y: u32| -> [u8; 3] {
          let line = rgb.line(y);
          [line[3 * x as usize], line[3 * x as usize + 1], line[3 * x as usize + 2]]
        };

        // Everything outside the 2-pixel top/left and 3-pixel
        // right/bottom border is reconstructed; the border copies the
        // nearest interior pixel
        for y in 0..height {
          for x in 0..width {
            let sx = x.clamp(2, width - 4);
            let sy = y.clamp(2, height - 4);
            if (sx, sy) != (x, y) {
              assert_eq!(px(x, y), px(sx, sy),
                         "{:?} {}x{}: border pixel ({}, {})", method, width, height, x, y);
            }
          }
        }

        // The interior genuinely extends to the clamp limits: on a ramp
        // the last reconstructed column/row is no copy of its neighbour
        assert_ne!(px(width - 4, height / 2), px(width - 5, height / 2),
                   "{:?} {}x{}", method, width, height);
        assert_ne!(px(width / 2, height - 4), px(width / 2, height - 5),
                   "{:?} {}x{}", method, width, height);
      }
    }
  }

  #[test]
  fn sixteen_bit_output_format() {
    let img = make_cfa(10, 10, CfaPattern::Grbg, 16, 40000, 20000, 10000);
    let rgb = demosaic_to_rgb(&img, DemosaicMethod::HqLinear).unwrap();
    assert_eq!(rgb.pix_fmt(), PixelFormat::Rgb16);
    let line = rgb.line(5);
    let r = u16::from_ne_bytes(line[18 .. 20].try_into().unwrap());
    let g = u16::from_ne_bytes(line[20 .. 22].try_into().unwrap());
    let b = u16::from_ne_bytes(line[22 .. 24].try_into().unwrap());
    assert_eq!((r, g, b), (40000, 20000, 10000));
  }

  #[test]
  fn mono8_output_averages_channels() {
    let img = make_cfa(12, 12, CfaPattern::Rggb, 8, 90, 60, 30);
    let mono = demosaic_to_mono8(&img, DemosaicMethod::Simple).unwrap();
    assert_eq!(mono.pix_fmt(), PixelFormat::Mono8);
    assert_eq!(mono.line(6)[6], 60);
  }

  #[test]
  fn tiny_images_pass_through_as_gray() {
    let img = make_cfa(4, 4, CfaPattern::Rggb, 8, 10, 20, 30);
    let rgb = demosaic_to_rgb(&img, DemosaicMethod::HqLinear).unwrap();
    // Raw mosaic values replicated into all channels
    assert_eq!(&rgb.line(0)[0 .. 3], [10, 10, 10]);
    assert_eq!(&rgb.line(0)[3 .. 6], [20, 20, 20]);
  }
}
