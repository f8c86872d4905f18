// Stage 4: stacking
//
// At init every triangle of the final mesh is rasterized (at the
// reference points' final positions) into the pixels it owns within the
// intersection, with their barycentric coordinates; an occupancy bitmap
// gives each pixel to the first triangle that claims it. Per frame, each
// triangle whose vertices are all valid is warped: the barycentric
// combination of the vertices' frame positions locates the source
// sample, which is read bilinearly, optionally flatfield-corrected, and
// accumulated. Finalization divides by the per-pixel contribution count.

use log::{debug, info};

use crate::array2d::Array2D;
use crate::demosaic::DemosaicMethod;
use crate::error::{Error, Result, StepResult};
use crate::geom::{PointF, Rect};
use crate::image::{Image, PixelFormat};
use crate::imgseq::ImageSequence;
use crate::refpt::RefPointAlignment;

struct RastPoint {
  x: u32,
  y: u32,
  u: f32,
  v: f32
}

pub struct Stacking<'a> {
  refpt: &'a RefPointAlignment<'a>,
  flatfield: Option<Image>, // Mono32f reciprocal gain map, frame-sized
  // Pixels owned by each triangle
  rast: Vec<Vec<RastPoint>>,
  stack: Vec<f32>, // interleaved, width * height * num_channels
  counts: Array2D<u32>,
  num_channels: usize,
  width: u32,
  height: u32,
  curr_frame: usize,
  is_complete: bool
}

// Build the reciprocal gain map from a raw flatfield exposure: output is
// Mono32f holding 1/raw, scaled so its maximum is 1 (dead pixels pass
// through with gain 1)
pub fn prepare_flatfield(raw: &Image) -> Result<Image> {
  let mono = raw.convert_pix_fmt(PixelFormat::Mono32f, DemosaicMethod::HqLinear)?;
  let mut max_inverse = 0.0f32;
  for y in 0..mono.height() {
    for x in 0..mono.width() {
      let v = mono.value_f32(x, y, 0);
      if v > 0.0 {
        max_inverse = max_inverse.max(1.0 / v);
      }
    }
  }
  if max_inverse == 0.0 {
    return Err(Error::InvalidParameters("flatfield is entirely black"));
  }

  let mut out = Image::new(mono.width(), mono.height(), PixelFormat::Mono32f, None)?;
  for y in 0..mono.height() {
    for x in 0..mono.width() {
      let v = mono.value_f32(x, y, 0);
      let gain = if v > 0.0 { (1.0 / v) / max_inverse } else { 1.0 };
      out.set_value_f32(x, y, 0, gain);
    }
  }
  return Ok(out);
}

// Average all active frames of a sequence into one Mono32f exposure,
// e.g. to obtain a flatfield from a dedicated flat video
pub fn mean_image_of_sequence(seq: &mut ImageSequence) -> Result<Image> {
  seq.seek_start()?;
  let first = seq.current_image()?
    .convert_pix_fmt(PixelFormat::Mono32f, DemosaicMethod::HqLinear)?;
  let width = first.width();
  let height = first.height();

  let mut sums = vec![0.0f64; (width * height) as usize];
  let mut num_frames = 0usize;
  loop {
    let mono = if num_frames == 0 {
      first.clone()
    } else {
      seq.current_image()?
        .convert_pix_fmt(PixelFormat::Mono32f, DemosaicMethod::HqLinear)?
    };
    if mono.width() != width || mono.height() != height {
      return Err(Error::InvalidDimensions);
    }
    for y in 0..height {
      for x in 0..width {
        sums[(y * width + x) as usize] += mono.value_f32(x, y, 0) as f64;
      }
    }
    num_frames += 1;
    match seq.seek_next() {
      Ok(()) => {},
      Err(Error::NoMoreImages) => break,
      Err(e) => return Err(e)
    }
  }

  let mut out = Image::new(width, height, PixelFormat::Mono32f, None)?;
  for y in 0..height {
    for x in 0..width {
      out.set_value_f32(x, y, 0, (sums[(y * width + x) as usize] / num_frames as f64) as f32);
    }
  }
  return Ok(out);
}

impl<'a> Stacking<'a> {
  pub fn init(seq: &mut ImageSequence, refpt: &'a RefPointAlignment<'a>,
              flatfield: Option<&Image>) -> Result<Stacking<'a>> {
    if !refpt.is_complete() {
      return Err(Error::InvalidParameters("reference-point alignment must be complete"));
    }

    let isec = refpt.quality_est().intersection();
    seq.seek_start()?;
    let (_, _, src_fmt) = seq.current_metadata()?;
    let num_channels = if src_fmt.num_channels() == 1 && !src_fmt.is_cfa() { 1 } else { 3 };

    let flatfield = match flatfield {
      Some(raw) => Some(prepare_flatfield(raw)?),
      None => None
    };

    let rast = rasterize_triangles(refpt, isec);
    let num_rast_px: usize = rast.iter().map(|r| r.len()).sum();
    info!(target: "stacking", "{} triangles rasterized to {} pixels, {} channel(s)",
          rast.len(), num_rast_px, num_channels);

    let mut stacking = Stacking {
      refpt: refpt,
      flatfield: flatfield,
      rast: rast,
      stack: vec![0.0; isec.width as usize * isec.height as usize * num_channels],
      counts: Array2D::zeroed(isec.height as usize, isec.width as usize),
      num_channels: num_channels,
      width: isec.width,
      height: isec.height,
      curr_frame: 0,
      is_complete: false
    };
    stacking.process_current_frame(seq)?;
    return Ok(stacking);
  }

  pub fn step(&mut self, seq: &mut ImageSequence) -> Result<StepResult> {
    match seq.seek_next() {
      Ok(()) => {},
      Err(Error::NoMoreImages) => {
        self.finalize();
        self.is_complete = true;
        return Ok(StepResult::LastStep);
      },
      Err(e) => return Err(e)
    }
    self.curr_frame += 1;
    self.process_current_frame(seq)?;
    return Ok(StepResult::More);
  }

  fn process_current_frame(&mut self, seq: &mut ImageSequence) -> Result<()> {
    let frame = self.curr_frame;
    debug_assert!(frame == seq.current_active_index());

    let img = seq.current_image()?;
    let stack_fmt = if self.num_channels == 1 {
      PixelFormat::Mono32f
    } else {
      PixelFormat::Rgb32f
    };
    let src = if img.pix_fmt() == stack_fmt {
      img
    } else {
      img.convert_pix_fmt(stack_fmt, DemosaicMethod::HqLinear)?
    };

    let isec = Rect::new(0, 0, self.width, self.height);
    let isec_in_frame = self.refpt.quality_est().alignment().intersection_in_frame(frame);
    let frame_ofs = PointF::new(isec_in_frame.x as f32, isec_in_frame.y as f32);

    let mut stacked_tris = 0usize;
    for (t_idx, tri) in self.refpt.triangulation().triangles().iter().enumerate() {
      if self.rast[t_idx].is_empty() {
        continue;
      }

      let mut vert_pos = [PointF::default(); 3];
      let mut all_valid = true;
      let mut any_inside = false;
      let mut all_inside = true;
      for (i, &p_idx) in tri.v.iter().enumerate() {
        let (pos, is_valid) = self.refpt.point_pos(p_idx, frame);
        all_valid &= is_valid;
        let inside = isec.contains(pos);
        any_inside |= inside;
        all_inside &= inside;
        vert_pos[i] = PointF::new(pos.x as f32, pos.y as f32);
      }
      if !all_valid || !any_inside {
        continue;
      }
      stacked_tris += 1;

      for rp in &self.rast[t_idx] {
        let w = 1.0 - rp.u - rp.v;
        let sx = rp.u * vert_pos[0].x + rp.v * vert_pos[1].x + w * vert_pos[2].x + frame_ofs.x;
        let sy = rp.u * vert_pos[0].y + rp.v * vert_pos[1].y + w * vert_pos[2].y + frame_ofs.y;

        // With all vertices inside the intersection the sample location
        // is guaranteed to fall within the frame; otherwise a sample
        // landing outside is dropped without a contribution
        if !all_inside {
          if sx < 0.0 || sy < 0.0
             || sx > src.width() as f32 - 1.0 || sy > src.height() as f32 - 1.0 {
            continue;
          }
        }

        let gain = match &self.flatfield {
          Some(ff) => {
            let fx = ((sx + 0.5).max(0.0) as u32).min(ff.width() - 1);
            let fy = ((sy + 0.5).max(0.0) as u32).min(ff.height() - 1);
            ff.value_f32(fx, fy, 0)
          },
          None => 1.0
        };

        let base = (rp.y as usize * self.width as usize + rp.x as usize) * self.num_channels;
        for c in 0..self.num_channels {
          self.stack[base + c] += gain * sample_bilinear(&src, sx, sy, c);
        }
        self.counts[rp.y as usize][rp.x as usize] += 1;
      }
    }
    debug!(target: "stacking", "frame {}: {} triangles stacked", frame, stacked_tris);
    return Ok(());
  }

  fn finalize(&mut self) {
    for y in 0..self.height as usize {
      for x in 0..self.width as usize {
        let n = self.counts[y][x].max(1) as f32;
        let base = (y * self.width as usize + x) * self.num_channels;
        for c in 0..self.num_channels {
          self.stack[base + c] /= n;
        }
      }
    }
    if self.flatfield.is_some() {
      // Flatfield gains shift the overall level; bring the peak back to 1
      let max = self.stack.iter().cloned().fold(0.0f32, f32::max);
      if max > 0.0 {
        for v in self.stack.iter_mut() {
          *v /= max;
        }
      }
    }
    info!(target: "stacking", "stack of {} frames finalized", self.curr_frame + 1);
  }

  pub fn is_complete(&self) -> bool {
    self.is_complete
  }

  // The finished composite (Mono32f or Rgb32f)
  pub fn image_stack(&self) -> Result<Image> {
    if !self.is_complete {
      return Err(Error::InvalidParameters("stacking is not complete"));
    }
    self.build_image(&self.stack)
  }

  // Snapshot of the stack so far, normalized by the current counts
  pub fn partial_image_stack(&self) -> Result<Image> {
    let mut copy = self.stack.clone();
    for y in 0..self.height as usize {
      for x in 0..self.width as usize {
        let n = self.counts[y][x].max(1) as f32;
        let base = (y * self.width as usize + x) * self.num_channels;
        for c in 0..self.num_channels {
          copy[base + c] /= n;
        }
      }
    }
    self.build_image(&copy)
  }

  pub fn contribution_count(&self, x: u32, y: u32) -> u32 {
    self.counts[y as usize][x as usize]
  }

  fn build_image(&self, values: &[f32]) -> Result<Image> {
    let fmt = if self.num_channels == 1 {
      PixelFormat::Mono32f
    } else {
      PixelFormat::Rgb32f
    };
    let mut out = Image::new(self.width, self.height, fmt, None)?;
    for y in 0..self.height {
      for x in 0..self.width {
        let base = (y as usize * self.width as usize + x as usize) * self.num_channels;
        for c in 0..self.num_channels {
          out.set_value_f32(x, y, c, values[base + c]);
        }
      }
    }
    return Ok(out);
  }
}

// Assign every intersection pixel to at most one triangle and remember
// its barycentric coordinates relative to the final vertex positions
fn rasterize_triangles(refpt: &RefPointAlignment, isec: Rect) -> Vec<Vec<RastPoint>> {
  let width = isec.width;
  let height = isec.height;
  let mut occupied: Array2D<bool> = Array2D::zeroed(height as usize, width as usize);
  let triangles = refpt.triangulation().triangles();
  let mut rast = Vec::with_capacity(triangles.len());

  for tri in triangles {
    let p0 = refpt.final_position(tri.v[0]);
    let p1 = refpt.final_position(tri.v[1]);
    let p2 = refpt.final_position(tri.v[2]);

    let det = (p1.y - p2.y) * (p0.x - p2.x) + (p2.x - p1.x) * (p0.y - p2.y);
    let mut points = Vec::new();
    if det.abs() > 1e-9 {
      let min_x = p0.x.min(p1.x).min(p2.x).floor().max(0.0) as u32;
      let max_x = (p0.x.max(p1.x).max(p2.x).ceil() as i64).min(width as i64 - 1);
      let min_y = p0.y.min(p1.y).min(p2.y).floor().max(0.0) as u32;
      let max_y = (p0.y.max(p1.y).max(p2.y).ceil() as i64).min(height as i64 - 1);

      let mut y = min_y as i64;
      while y <= max_y {
        let mut x = min_x as i64;
        while x <= max_x {
          if !occupied[y as usize][x as usize] {
            let px = x as f32;
            let py = y as f32;
            let u = ((p1.y - p2.y) * (px - p2.x) + (p2.x - p1.x) * (py - p2.y)) / det;
            let v = ((p2.y - p0.y) * (px - p2.x) + (p0.x - p2.x) * (py - p2.y)) / det;
            let w = 1.0 - u - v;
            if u >= 0.0 && v >= 0.0 && w >= 0.0 {
              occupied[y as usize][x as usize] = true;
              points.push(RastPoint { x: x as u32, y: y as u32, u: u, v: v });
            }
          }
          x += 1;
        }
        y += 1;
      }
    }
    rast.push(points);
  }
  return rast;
}

// Bilinear sample of a float image; the caller keeps (x, y) within
// [0, width-1] x [0, height-1]
fn sample_bilinear(img: &Image, x: f32, y: f32, channel: usize) -> f32 {
  let max_x = img.width() as f32 - 1.0;
  let max_y = img.height() as f32 - 1.0;
  let cx = x.clamp(0.0, max_x);
  let cy = y.clamp(0.0, max_y);

  let x0 = (cx.floor() as u32).min(img.width().saturating_sub(2));
  let y0 = (cy.floor() as u32).min(img.height().saturating_sub(2));
  let tx = cx - x0 as f32;
  let ty = cy - y0 as f32;
  let x1 = (x0 + 1).min(img.width() - 1);
  let y1 = (y0 + 1).min(img.height() - 1);

  let v00 = img.value_f32(x0, y0, channel);
  let v10 = img.value_f32(x1, y0, channel);
  let v01 = img.value_f32(x0, y1, channel);
  let v11 = img.value_f32(x1, y1, channel);
  v00 * (1.0 - tx) * (1.0 - ty) + v10 * tx * (1.0 - ty)
    + v01 * (1.0 - tx) * ty + v11 * tx * ty
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::align::{AlignmentMethod, ImgAlignment};
  use crate::bmp;
  use crate::geom::Point;
  use crate::quality::{QualityEstParams, QualityEstimation};
  use crate::refpt::{QualityCriterion, RefPtParams};
  use tempfile::tempdir;

  fn noise_value(x: u32, y: u32) -> u8 {
    ((x.wrapping_mul(73) ^ y.wrapping_mul(151)).wrapping_mul(13) % 251) as u8
  }

  fn identical_noise_sequence(dir: &std::path::Path, n: usize) -> ImageSequence {
    let mut paths = Vec::new();
    for i in 0..n {
      let mut img = Image::new(128, 128, PixelFormat::Mono8, None).unwrap();
      for y in 0..128 {
        for x in 0..128 {
          img.line_mut(y)[x as usize] = noise_value(x, y);
        }
      }
      let path = dir.join(format!("s{}.bmp", i));
      bmp::save_bmp(&img, &path).unwrap();
      paths.push(path);
    }
    ImageSequence::from_image_list(paths).unwrap()
  }

  #[test]
  fn identical_frames_stack_to_the_input() {
    let dir = tempdir().unwrap();
    let num_frames = 3;
    let mut seq = identical_noise_sequence(dir.path(), num_frames);

    let mut align = ImgAlignment::init(&mut seq, AlignmentMethod::Centroid).unwrap();
    while align.step(&mut seq).unwrap() == StepResult::More {}
    let mut qual = QualityEstimation::init(&mut seq, &align, QualityEstParams::default()).unwrap();
    while qual.step(&mut seq).unwrap() == StepResult::More {}

    let params = RefPtParams {
      positions: vec![Point::new(32, 32), Point::new(96, 32),
                      Point::new(64, 96), Point::new(32, 96)],
      quality_criterion: QualityCriterion::PercentageBest(100),
      spacing: 30,
      ..Default::default()
    };
    let mut refpt = crate::refpt::RefPointAlignment::init(&mut seq, &qual, params).unwrap();
    while refpt.step(&mut seq).unwrap() == StepResult::More {}

    let mut stacking = Stacking::init(&mut seq, &refpt, None).unwrap();
    while stacking.step(&mut seq).unwrap() == StepResult::More {}
    assert!(stacking.is_complete());

    let out = stacking.image_stack().unwrap();
    assert_eq!(out.pix_fmt(), PixelFormat::Mono32f);

    // Central pixels: full contribution count and values matching the
    // source exactly (integer sample positions, identical frames)
    let mut checked = 0;
    for y in 40..90u32 {
      for x in 40..90u32 {
        if stacking.contribution_count(x, y) == num_frames as u32 {
          let expected = noise_value(x, y) as f32 / 255.0;
          let got = out.value_f32(x, y, 0);
          assert!((got - expected).abs() < 1e-5,
                  "pixel ({}, {}): {} vs {}", x, y, got, expected);
          checked += 1;
        }
      }
    }
    assert!(checked > 2000, "only {} central pixels fully stacked", checked);
  }

  #[test]
  fn rasterization_gives_each_pixel_one_owner() {
    let dir = tempdir().unwrap();
    let mut seq = identical_noise_sequence(dir.path(), 2);

    let mut align = ImgAlignment::init(&mut seq, AlignmentMethod::Centroid).unwrap();
    while align.step(&mut seq).unwrap() == StepResult::More {}
    let mut qual = QualityEstimation::init(&mut seq, &align, QualityEstParams::default()).unwrap();
    while qual.step(&mut seq).unwrap() == StepResult::More {}
    let params = RefPtParams {
      positions: vec![Point::new(40, 40), Point::new(90, 50), Point::new(60, 90)],
      quality_criterion: QualityCriterion::PercentageBest(100),
      spacing: 30,
      ..Default::default()
    };
    let mut refpt = crate::refpt::RefPointAlignment::init(&mut seq, &qual, params).unwrap();
    while refpt.step(&mut seq).unwrap() == StepResult::More {}

    let rast = rasterize_triangles(&refpt, qual.intersection());
    let mut seen = std::collections::HashSet::new();
    let mut total = 0usize;
    for tri_points in &rast {
      for rp in tri_points {
        assert!(seen.insert((rp.x, rp.y)), "pixel ({}, {}) claimed twice", rp.x, rp.y);
        total += 1;
      }
    }
    // The mesh (boundary fence included) covers the entire intersection
    assert!(total >= (128 * 128) * 9 / 10, "only {} pixels rasterized", total);
  }

  #[test]
  fn sequence_mean_is_the_per_pixel_average() {
    let dir = tempdir().unwrap();
    let mut paths = Vec::new();
    for (i, value) in [100u8, 200u8].iter().enumerate() {
      let data = vec![*value; 8 * 8];
      let img = Image::from_pixels(8, 8, PixelFormat::Mono8, None, data).unwrap();
      let path = dir.path().join(format!("flat{}.bmp", i));
      bmp::save_bmp(&img, &path).unwrap();
      paths.push(path);
    }
    let mut seq = ImageSequence::from_image_list(paths).unwrap();

    let mean = mean_image_of_sequence(&mut seq).unwrap();
    assert_eq!(mean.pix_fmt(), PixelFormat::Mono32f);
    let expected = (100.0 / 255.0 + 200.0 / 255.0) / 2.0;
    assert!((mean.value_f32(4, 4, 0) - expected).abs() < 1e-6);
  }

  #[test]
  fn flatfield_normalizes_to_unity_peak() {
    let mut raw = Image::new(4, 4, PixelFormat::Mono8, None).unwrap();
    for y in 0..4 {
      for x in 0..4usize {
        raw.line_mut(y)[x] = if (x + y as usize) % 2 == 0 { 200 } else { 100 };
      }
    }
    let ff = prepare_flatfield(&raw).unwrap();
    let mut max = 0.0f32;
    for y in 0..4 {
      for x in 0..4 {
        max = max.max(ff.value_f32(x, y, 0));
      }
    }
    assert!((max - 1.0).abs() < 1e-6);
    // Darker raw pixels get proportionally higher gain
    assert!((ff.value_f32(1, 0, 0) / ff.value_f32(0, 0, 0) - 2.0).abs() < 1e-5);
  }
}
