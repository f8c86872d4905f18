// Block matching by sum of squared differences over a shrinking search grid

use crate::geom::Point;
use crate::image::Image;

// Sentinel comparison score: no acceptable overlap between the reference
// block and the image at the tried position
pub const NO_VALID_MATCH: u64 = u64::MAX;

// Find the position in `img` (Mono8) whose neighbourhood best matches
// `ref_block` (Mono8), starting the search at `ref_pos`.
//
// The search runs in passes: a grid of +/- radius around the current best
// position is scanned at offsets that are multiples of the step, the step
// is halved and the grid shrinks to +/- previous step, until the step
// reaches zero. Positions where the block sticks too far out of the image
// are rejected via the NO_VALID_MATCH score.
pub fn find_matching_position(ref_pos: Point, ref_block: &Image, img: &Image,
                              search_radius: u32, initial_search_step: u32) -> Point {
  debug_assert!(ref_block.pix_fmt().bytes_per_pixel() == 1);
  debug_assert!(img.pix_fmt().bytes_per_pixel() == 1);

  let mut best_pos = ref_pos;
  let mut radius = search_radius as i32;
  let mut step = initial_search_step as i32;

  while step > 0 {
    let center = best_pos;
    let mut best_sum = NO_VALID_MATCH;

    let mut dy = -radius;
    while dy <= radius {
      let mut dx = -radius;
      while dx <= radius {
        let pos = center + Point::new(dx, dy);
        let sum = sum_sqr_diffs(ref_block, img, pos);
        if sum < best_sum {
          best_sum = sum;
          best_pos = pos;
        }
        dx += step;
      }
      dy += step;
    }

    radius = step;
    step /= 2;
  }
  return best_pos;
}

// Squared-difference score of `ref_block` centered at `pos` in `img`.
// Only the intersection of the block with the image is compared; the sum
// is scaled by block_area/intersection_area to stay comparable across
// positions, and intersections under a quarter of the block are rejected.
pub fn sum_sqr_diffs(ref_block: &Image, img: &Image, pos: Point) -> u64 {
  let blk_w = ref_block.width() as i32;
  let blk_h = ref_block.height() as i32;
  let img_w = img.width() as i32;
  let img_h = img.height() as i32;

  // Top-left corner of the block when centered at `pos`
  let blk_x = pos.x - blk_w / 2;
  let blk_y = pos.y - blk_h / 2;

  let x0 = blk_x.max(0);
  let y0 = blk_y.max(0);
  let x1 = (blk_x + blk_w).min(img_w);
  let y1 = (blk_y + blk_h).min(img_h);
  if x1 <= x0 || y1 <= y0 {
    return NO_VALID_MATCH;
  }

  let blk_area = (blk_w as u64) * (blk_h as u64);
  let inter_area = ((x1 - x0) as u64) * ((y1 - y0) as u64);
  if 4 * inter_area < blk_area {
    return NO_VALID_MATCH;
  }

  let mut sum = 0u64;
  for y in y0..y1 {
    let img_line = img.line(y as u32);
    let blk_line = ref_block.line((y - blk_y) as u32);
    for x in x0..x1 {
      let diff = img_line[x as usize] as i64 - blk_line[(x - blk_x) as usize] as i64;
      sum += (diff * diff) as u64;
    }
  }
  return sum * blk_area / inter_area;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geom::Rect;
  use crate::image::{Image, PixelFormat};

  // Soft radial blob centered at (cx, cy)
  fn blob_image(width: u32, height: u32, cx: i32, cy: i32) -> Image {
    let mut img = Image::new(width, height, PixelFormat::Mono8, None).unwrap();
    for y in 0..height {
      for x in 0..width {
        let d2 = (x as i32 - cx).pow(2) + (y as i32 - cy).pow(2);
        img.line_mut(y)[x as usize] = (255 - d2.min(255)) as u8;
      }
    }
    return img;
  }

  #[test]
  fn recovers_lattice_shift() {
    let reference = blob_image(64, 64, 32, 32);
    let shifted = blob_image(64, 64, 36, 28); // blob moved by (4, -4)
    let pos = Point::new(32, 32);
    let block = reference.fragment(Rect::new(32 - 8, 32 - 8, 16, 16)).unwrap();

    let found = find_matching_position(pos, &block, &shifted, 8, 4);
    assert_eq!(found, Point::new(36, 28));
  }

  #[test]
  fn recovers_off_lattice_shift() {
    let reference = blob_image(64, 64, 30, 33);
    let shifted = blob_image(64, 64, 31, 34); // blob moved by (1, 1)
    let pos = Point::new(30, 33);
    let block = reference.fragment(Rect::new(30 - 8, 33 - 8, 16, 16)).unwrap();

    let found = find_matching_position(pos, &block, &shifted, 4, 2);
    assert_eq!(found, Point::new(31, 34));
  }

  #[test]
  fn tiny_intersection_is_rejected() {
    let img = blob_image(32, 32, 16, 16);
    let block = img.fragment(Rect::new(8, 8, 16, 16)).unwrap();
    // Centered far outside: overlap below a quarter of the block
    assert_eq!(sum_sqr_diffs(&block, &img, Point::new(-7, 16)), NO_VALID_MATCH);
    // Full overlap at a matching position scores zero
    assert_eq!(sum_sqr_diffs(&block, &img, Point::new(16, 16)), 0);
  }
}
