// Stage 2: per-tile quality estimation
//
// The intersection is divided into a grid of area_size tiles (smaller
// remainder tiles at the right/bottom edges). Every active frame gets a
// sharpness score per tile; once all frames are seen, each tile stores a
// reference block cut from the frame where it scored best. Those blocks
// are the local exemplars used for reference-point placement and
// matching in the next stage.

use log::{debug, info};

use crate::align::ImgAlignment;
use crate::array2d::Array2D;
use crate::demosaic::DemosaicMethod;
use crate::error::{Error, Result, StepResult};
use crate::filters::{box_blur, estimate_quality};
use crate::geom::{Point, Rect};
use crate::image::{Image, PixelFormat};
use crate::imgseq::ImageSequence;

// Reference blocks cover three times the tile, so a block matcher probing
// around the tile center stays inside the exemplar
const REF_BLOCK_SIZE_FACTOR: u32 = 3;

// Half-size of the analysis patch used by the placement fitness tests
const FITNESS_PATCH_RADIUS: i32 = 32;
const GRADIENT_HISTOGRAM_BINS: usize = 512;

#[derive(Clone, Debug)]
pub struct QualityEstParams {
  pub area_size: u32,
  pub detail_radius: u32,
  // Reproduce the historical accumulation of the maximum reference-block
  // brightness (which tracked the smallest per-block maximum); off means
  // a plain running maximum
  pub legacy_brightness_stats: bool
}

impl Default for QualityEstParams {
  fn default() -> Self {
    QualityEstParams {
      area_size: 40,
      detail_radius: 3,
      legacy_brightness_stats: false
    }
  }
}

struct AreaStats {
  min: f32,
  max: f32,
  best_frame: usize
}

struct RefBlock {
  image: Image, // Mono8
  // Position of the block's top-left corner in intersection coordinates
  origin: Point
}

struct QualityArea {
  rect: Rect, // in intersection coordinates
  ref_block: Option<RefBlock>
}

pub struct QualityEstimation<'a> {
  align: &'a ImgAlignment,
  params: QualityEstParams,
  areas: Vec<QualityArea>,
  num_cols: usize,
  num_rows: usize,
  // [area][active frame]
  qualities: Array2D<f32>,
  area_stats: Vec<AreaStats>,
  frame_sums: Vec<f32>,
  // Absolute sequence index of each processed active frame
  frame_abs_indices: Vec<usize>,
  ref_block_brightness: (u8, u8),
  is_complete: bool
}

impl<'a> QualityEstimation<'a> {
  pub fn init(seq: &mut ImageSequence, align: &'a ImgAlignment,
              params: QualityEstParams) -> Result<QualityEstimation<'a>> {
    if !align.is_complete() {
      return Err(Error::InvalidParameters("alignment must be complete"));
    }
    if params.area_size == 0 || params.detail_radius == 0 {
      return Err(Error::InvalidParameters("area size and detail radius must be positive"));
    }

    let isec = align.intersection();
    let size = params.area_size;
    let num_cols = isec.width.div_ceil(size) as usize;
    let num_rows = isec.height.div_ceil(size) as usize;

    let mut areas = Vec::with_capacity(num_cols * num_rows);
    for row in 0..num_rows {
      for col in 0..num_cols {
        let x = col as u32 * size;
        let y = row as u32 * size;
        areas.push(QualityArea {
          rect: Rect::new(x as i32, y as i32,
                          size.min(isec.width - x), size.min(isec.height - y)),
          ref_block: None
        });
      }
    }
    info!(target: "quality", "{} x {} tile grid over {}x{} intersection",
          num_cols, num_rows, isec.width, isec.height);

    let num_frames = align.num_frames();
    let num_areas = areas.len();
    let mut est = QualityEstimation {
      align: align,
      params: params,
      areas: areas,
      num_cols: num_cols,
      num_rows: num_rows,
      qualities: Array2D::zeroed(num_areas, num_frames),
      area_stats: (0..num_areas).map(|_| AreaStats {
        min: f32::MAX,
        max: f32::MIN,
        best_frame: 0
      }).collect(),
      frame_sums: vec![0.0; num_frames],
      frame_abs_indices: Vec::with_capacity(num_frames),
      ref_block_brightness: (0, 0),
      is_complete: false
    };

    seq.seek_start()?;
    est.process_current_frame(seq)?;
    return Ok(est);
  }

  pub fn step(&mut self, seq: &mut ImageSequence) -> Result<StepResult> {
    match seq.seek_next() {
      Ok(()) => {},
      Err(Error::NoMoreImages) => {
        self.create_reference_blocks(seq)?;
        self.is_complete = true;
        return Ok(StepResult::LastStep);
      },
      Err(e) => return Err(e)
    }
    self.process_current_frame(seq)?;
    return Ok(StepResult::More);
  }

  fn process_current_frame(&mut self, seq: &mut ImageSequence) -> Result<()> {
    let frame_idx = seq.current_active_index();
    self.frame_abs_indices.push(seq.current_index());

    let img = seq.current_image()?;
    let region = self.align.intersection_in_frame(frame_idx);
    let mono = img.convert_pix_fmt_of_subimage(PixelFormat::Mono8,
                                               region.x, region.y,
                                               region.width, region.height,
                                               DemosaicMethod::Simple)?;

    let mut frame_sum = 0.0f32;
    for (area_idx, area) in self.areas.iter().enumerate() {
      let tile = mono.fragment(area.rect)?;
      let q = estimate_quality(&tile, self.params.detail_radius)?;
      self.qualities[area_idx][frame_idx] = q;
      frame_sum += q;

      let stats = &mut self.area_stats[area_idx];
      if q < stats.min {
        stats.min = q;
      }
      if q > stats.max {
        stats.max = q;
        stats.best_frame = frame_idx;
      }
    }
    self.frame_sums[frame_idx] = frame_sum;
    debug!(target: "quality", "frame {}: total quality {}", frame_idx, frame_sum);
    return Ok(());
  }

  // After the last frame: cut each tile's reference block out of the
  // frame where the tile scored highest
  fn create_reference_blocks(&mut self, seq: &mut ImageSequence) -> Result<()> {
    let mut overall_min = u8::MAX;
    let mut overall_max = if self.params.legacy_brightness_stats { u8::MAX } else { 0 };

    for area_idx in 0..self.areas.len() {
      let best_frame = self.area_stats[area_idx].best_frame;
      let abs_idx = self.frame_abs_indices[best_frame];
      let img = seq.image_at(abs_idx)?;

      let tile = self.areas[area_idx].rect;
      let window_size = REF_BLOCK_SIZE_FACTOR * self.params.area_size;
      let center = Point::new(tile.x + tile.width as i32 / 2,
                              tile.y + tile.height as i32 / 2);

      // Window in the best frame's coordinates, clipped to the frame
      let frame_isec = self.align.intersection_in_frame(best_frame);
      let window = Rect::new(frame_isec.x + center.x - window_size as i32 / 2,
                             frame_isec.y + center.y - window_size as i32 / 2,
                             window_size, window_size)
                     .intersect(&img.rect());

      let block = img.convert_pix_fmt_of_subimage(PixelFormat::Mono8,
                                                  window.x, window.y,
                                                  window.width, window.height,
                                                  DemosaicMethod::Simple)?;

      let (bmin, bmax) = min_max_brightness(&block);
      overall_min = overall_min.min(bmin);
      if self.params.legacy_brightness_stats {
        if bmax < overall_max {
          overall_max = bmax;
        }
      } else if bmax > overall_max {
        overall_max = bmax;
      }

      self.areas[area_idx].ref_block = Some(RefBlock {
        image: block,
        origin: Point::new(window.x - frame_isec.x, window.y - frame_isec.y)
      });
    }

    self.ref_block_brightness = (overall_min, overall_max);
    info!(target: "quality", "reference blocks ready, brightness range {}..{}",
          overall_min, overall_max);
    return Ok(());
  }

  pub fn is_complete(&self) -> bool {
    self.is_complete
  }

  pub fn alignment(&self) -> &ImgAlignment {
    self.align
  }

  pub fn intersection(&self) -> Rect {
    self.align.intersection()
  }

  pub fn num_areas(&self) -> usize {
    self.areas.len()
  }

  pub fn num_frames(&self) -> usize {
    self.align.num_frames()
  }

  pub fn area_quality(&self, area: usize, frame: usize) -> f32 {
    self.qualities[area][frame]
  }

  pub fn best_frame_of_area(&self, area: usize) -> usize {
    self.area_stats[area].best_frame
  }

  // Active frame with the highest total quality
  pub fn best_frame(&self) -> usize {
    let mut best = 0;
    for (i, &sum) in self.frame_sums.iter().enumerate() {
      if sum > self.frame_sums[best] {
        best = i;
      }
    }
    return best;
  }

  pub fn frame_abs_index(&self, active_frame_idx: usize) -> usize {
    self.frame_abs_indices[active_frame_idx]
  }

  // Brightness range over all reference blocks
  pub fn ref_block_brightness_range(&self) -> (u8, u8) {
    self.ref_block_brightness
  }

  // Mosaic of every tile's best-frame exemplar: a quick preview of the
  // sharpest material available before any warping is done
  pub fn best_fragments_image(&self) -> Result<Image> {
    if !self.is_complete {
      return Err(Error::InvalidParameters("quality estimation must be complete"));
    }
    let isec = self.align.intersection();
    let mut out = Image::new(isec.width, isec.height, PixelFormat::Mono8, None)?;

    for area in &self.areas {
      let block = area.ref_block.as_ref().unwrap();
      let rel = area.rect.pos() - block.origin;
      for y in 0..area.rect.height {
        let src_line = block.image.line((rel.y as u32) + y);
        let src = &src_line[rel.x as usize .. rel.x as usize + area.rect.width as usize];
        let dst_line = out.line_mut(area.rect.y as u32 + y);
        dst_line[area.rect.x as usize .. area.rect.x as usize + area.rect.width as usize]
          .copy_from_slice(src);
      }
    }
    return Ok(out);
  }

  // Tile index owning a point of the intersection
  pub fn area_index_at(&self, pos: Point) -> usize {
    let size = self.params.area_size as i32;
    let col = (pos.x / size).clamp(0, self.num_cols as i32 - 1) as usize;
    let row = (pos.y / size).clamp(0, self.num_rows as i32 - 1) as usize;
    row * self.num_cols + col
  }

  // Cut a square of `desired_size` around `center` (intersection
  // coordinates) out of the owning tile's reference block. The square is
  // clipped so it stays inside the block, so the result may be smaller.
  pub fn create_reference_block(&self, center: Point, desired_size: u32) -> Result<Image> {
    let area = &self.areas[self.area_index_at(center)];
    let block = area.ref_block.as_ref()
      .ok_or(Error::InvalidParameters("reference blocks not created yet"))?;

    let rel = center - block.origin;
    let rect = Rect::new(rel.x - desired_size as i32 / 2,
                         rel.y - desired_size as i32 / 2,
                         desired_size, desired_size)
                 .intersect(&block.image.rect());
    if rect.is_empty() {
      return Err(Error::InvalidParameters("reference point outside its tile's block"));
    }
    block.image.fragment(rect)
  }

  // Automatic reference-point placement: walk the intersection on a
  // `spacing` grid and keep, per cell, the sub-position with the best
  // structure fitness, skipping candidates that crowd a neighbour cell's
  // point. See the fitness helpers below for the three gates.
  pub fn suggest_reference_point_positions(&self,
                                           brightness_threshold: f32,
                                           structure_threshold: f32,
                                           structure_scale: u32,
                                           spacing: u32,
                                           ref_block_size: u32) -> Result<Vec<Point>> {
    if !self.is_complete {
      return Err(Error::InvalidParameters("quality estimation must be complete"));
    }
    let isec = self.align.intersection();
    let grid_cols = isec.width.div_ceil(spacing) as usize;
    let grid_rows = isec.height.div_ceil(spacing) as usize;
    let mut grid: Vec<Option<Point>> = vec![None; grid_cols * grid_rows];
    let sub_step = (ref_block_size / 2).max(1);

    for row in 0..grid_rows {
      for col in 0..grid_cols {
        let cell_x = col as u32 * spacing;
        let cell_y = row as u32 * spacing;

        let mut best: Option<(f32, Point)> = None;
        let mut y = cell_y;
        while y < (cell_y + spacing).min(isec.height) {
          let mut x = cell_x;
          while x < (cell_x + spacing).min(isec.width) {
            let pos = Point::new(x as i32, y as i32);
            let fitness = self.fitness_at(pos, brightness_threshold, structure_scale);
            if fitness >= structure_threshold
               && best.map_or(true, |(bf, _)| fitness > bf) {
              best = Some((fitness, pos));
            }
            x += sub_step;
          }
          y += sub_step;
        }

        if let Some((_, pos)) = best {
          // Reject candidates crowding a point already placed in one of
          // the 8 neighbouring cells
          let mut crowded = false;
          for dr in -1i32 ..= 1 {
            for dc in -1i32 ..= 1 {
              let r = row as i32 + dr;
              let c = col as i32 + dc;
              if r < 0 || c < 0 || r >= grid_rows as i32 || c >= grid_cols as i32 {
                continue;
              }
              if let Some(other) = grid[r as usize * grid_cols + c as usize] {
                if other.sqr_dist(pos) < (spacing as i64) * (spacing as i64) {
                  crowded = true;
                }
              }
            }
          }
          if !crowded {
            grid[row * grid_cols + col] = Some(pos);
          }
        }
      }
    }

    let positions: Vec<Point> = grid.into_iter().flatten().collect();
    info!(target: "quality", "suggested {} reference point positions", positions.len());
    return Ok(positions);
  }

  // Fitness of a candidate position; zero when any gate rejects it
  fn fitness_at(&self, pos: Point, brightness_threshold: f32, structure_scale: u32) -> f32 {
    let area = &self.areas[self.area_index_at(pos)];
    let block = match &area.ref_block {
      Some(b) => b,
      None => return 0.0
    };
    let rel = pos - block.origin;

    if !brightness_gate(&block.image, rel, self.ref_block_brightness, brightness_threshold) {
      return 0.0;
    }

    // Blurred analysis patch around the candidate
    let patch_rect = Rect::new(rel.x - FITNESS_PATCH_RADIUS, rel.y - FITNESS_PATCH_RADIUS,
                               2 * FITNESS_PATCH_RADIUS as u32 + 1,
                               2 * FITNESS_PATCH_RADIUS as u32 + 1)
                       .intersect(&block.image.rect());
    if patch_rect.width < 16 || patch_rect.height < 16 {
      return 0.0;
    }
    let patch = match block.image.fragment(patch_rect) {
      Ok(p) => match box_blur(&p, 1, 3) {
        Ok(b) => b,
        Err(_) => return 0.0
      },
      Err(_) => return 0.0
    };

    if !gradient_directions_acceptable(&patch) {
      return 0.0;
    }
    return structure_score(&patch, structure_scale);
  }
}

fn min_max_brightness(img: &Image) -> (u8, u8) {
  let mut bmin = u8::MAX;
  let mut bmax = u8::MIN;
  for &v in img.pixels() {
    bmin = bmin.min(v);
    bmax = bmax.max(v);
  }
  (bmin, bmax)
}

// Gate 1: a 5-pixel neighbourhood must contain something bright (above
// the relative threshold within the global reference-block range) and
// must not be a saturated disc interior (over a third of it at 255)
fn brightness_gate(block: &Image, rel: Point, global_range: (u8, u8),
                   threshold: f32) -> bool {
  let (gmin, gmax) = global_range;
  let min_accepted = gmin as f32 + threshold * (gmax as f32 - gmin as f32);

  let mut num_bright = 0usize;
  let mut num_unsaturated = 0usize;
  let mut total = 0usize;
  for dy in -5i32 ..= 5 {
    for dx in -5i32 ..= 5 {
      let x = rel.x + dx;
      let y = rel.y + dy;
      if x < 0 || y < 0 || x >= block.width() as i32 || y >= block.height() as i32 {
        continue;
      }
      let v = block.value8(x as u32, y as u32);
      total += 1;
      if v as f32 >= min_accepted {
        num_bright += 1;
      }
      if v < 0xFF {
        num_unsaturated += 1;
      }
    }
  }
  total > 0 && num_bright >= 1 && 3 * num_unsaturated > total
}

// Gate 2: histogram of Sobel gradient directions (512 bins, weighted by
// magnitude, median-smoothed). A long empty arc combined with a short
// occupied arc means one dominant edge direction, along which a block
// matcher would slide; such positions are rejected.
fn gradient_directions_acceptable(patch: &Image) -> bool {
  let w = patch.width() as i32;
  let h = patch.height() as i32;
  let mut histogram = [0.0f64; GRADIENT_HISTOGRAM_BINS];

  for y in 1 .. h - 1 {
    for x in 1 .. w - 1 {
      let at = |dx: i32, dy: i32| patch.value8((x + dx) as u32, (y + dy) as u32) as f64;
      let gx = (at(1, -1) + 2.0 * at(1, 0) + at(1, 1))
             - (at(-1, -1) + 2.0 * at(-1, 0) + at(-1, 1));
      let gy = (at(-1, 1) + 2.0 * at(0, 1) + at(1, 1))
             - (at(-1, -1) + 2.0 * at(0, -1) + at(1, -1));
      let magnitude = (gx * gx + gy * gy).sqrt();
      if magnitude > 0.0 {
        let angle = gy.atan2(gx); // -pi..pi
        let mut bin = ((angle + std::f64::consts::PI) / (2.0 * std::f64::consts::PI)
                       * GRADIENT_HISTOGRAM_BINS as f64) as usize;
        if bin >= GRADIENT_HISTOGRAM_BINS {
          bin = GRADIENT_HISTOGRAM_BINS - 1;
        }
        histogram[bin] += magnitude;
      }
    }
  }

  // Median filter of radius 1 (circular)
  let n = GRADIENT_HISTOGRAM_BINS;
  let mut smoothed = [0.0f64; GRADIENT_HISTOGRAM_BINS];
  for i in 0..n {
    let mut window = [histogram[(i + n - 1) % n], histogram[i], histogram[(i + 1) % n]];
    window.sort_by(|a, b| a.partial_cmp(b).unwrap());
    smoothed[i] = window[1];
  }

  let longest_zero = longest_circular_run(&smoothed, |v| v == 0.0);
  let longest_nonzero = longest_circular_run(&smoothed, |v| v > 0.0);
  !(longest_zero > n / 3 && longest_nonzero < n / 4)
}

fn longest_circular_run(values: &[f64], pred: impl Fn(f64) -> bool) -> usize {
  let n = values.len();
  let mut longest = 0usize;
  let mut run = 0usize;
  // Doubling the scan handles runs wrapping around the end
  for i in 0 .. 2 * n {
    if pred(values[i % n]) {
      run += 1;
      longest = longest.max(run.min(n));
    } else {
      run = 0;
    }
  }
  return longest;
}

// Gate 3 / score: local structure at the wanted scale. The patch is
// compared against itself shifted around two concentric square shells;
// their ratio grows when detail exists at the scale of the inner shell.
fn structure_score(patch: &Image, scale: u32) -> f32 {
  let shell1 = shell_mean_sqr_diff(patch, scale.max(1) as i32);
  let shell2 = shell_mean_sqr_diff(patch, 2 * scale.max(1) as i32);
  if shell1 == 0.0 {
    return 0.0;
  }
  (shell2 / shell1) as f32
}

// Mean per-pixel squared difference between the patch and its copies
// shifted to every position of the square ring of the given radius
fn shell_mean_sqr_diff(patch: &Image, radius: i32) -> f64 {
  let w = patch.width() as i32;
  let h = patch.height() as i32;
  let mut total = 0.0f64;
  let mut num_shifts = 0usize;

  for dy in -radius ..= radius {
    for dx in -radius ..= radius {
      if dx.abs().max(dy.abs()) != radius {
        continue; // ring positions only
      }
      let mut sum = 0u64;
      let mut count = 0u64;
      for y in 0..h {
        let sy = y + dy;
        if sy < 0 || sy >= h {
          continue;
        }
        for x in 0..w {
          let sx = x + dx;
          if sx < 0 || sx >= w {
            continue;
          }
          let d = patch.value8(x as u32, y as u32) as i64
                - patch.value8(sx as u32, sy as u32) as i64;
          sum += (d * d) as u64;
          count += 1;
        }
      }
      if count > 0 {
        total += sum as f64 / count as f64;
        num_shifts += 1;
      }
    }
  }
  if num_shifts == 0 {
    return 0.0;
  }
  total / num_shifts as f64
}
