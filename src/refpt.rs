// Stage 3: reference-point alignment
//
// A mesh of reference points is laid over the intersection (picked
// automatically from the quality stage's exemplars unless supplied),
// fenced by fixed boundary points, and triangulated. Per frame, each
// triangle whose tiles score well enough has its points block-matched
// against the frame; freshly accepted translations pass through a
// sliding-window statistics gate that throws out runaway matches. A
// final repair pass guarantees every triangle has at least one frame in
// which all of its vertices hold valid positions.

use log::{debug, info};

use crate::array2d::Array2D;
use crate::blockmatch::find_matching_position;
use crate::demosaic::DemosaicMethod;
use crate::error::{Error, Result, StepResult};
use crate::geom::{Point, PointF, Rect};
use crate::image::{Image, PixelFormat};
use crate::imgseq::ImageSequence;
use crate::quality::QualityEstimation;
use crate::triangulation::{find_delaunay_triangulation, Triangulation};

// Ring buffer length for translation statistics (frames)
const STATS_WINDOW: usize = 10;
// Accepted translations beyond mean + OUTLIER_SIGMAS * stddev are reverted
const OUTLIER_SIGMAS: f64 = 1.5;
// Initial block-matcher step for reference points
const POINT_SEARCH_STEP: u32 = 2;
// Fixed points per intersection side
const BOUNDARY_POINTS_PER_SIDE: i32 = 4;

#[derive(Clone, Copy, Debug)]
pub enum QualityCriterion {
  // Accept a frame whose triangle quality ranks in the top k percent
  PercentageBest(u32),
  // Accept when quality >= min + (k/100) * (max - min)
  MinRelQuality(f32),
  // Accept the k best frames
  NumberBest(u32)
}

#[derive(Clone, Debug)]
pub struct RefPtParams {
  // Reference point positions in intersection coordinates;
  // empty selects them automatically
  pub positions: Vec<Point>,
  pub quality_criterion: QualityCriterion,
  pub spacing: u32,
  pub structure_threshold: f32,
  pub structure_scale: u32,
  pub brightness_threshold: f32
}

impl Default for RefPtParams {
  fn default() -> Self {
    RefPtParams {
      positions: Vec::new(),
      quality_criterion: QualityCriterion::PercentageBest(30),
      spacing: 40,
      structure_threshold: 1.2,
      structure_scale: 2,
      brightness_threshold: 0.33
    }
  }
}

#[derive(Clone, Copy)]
struct FramePos {
  pos: Point,
  is_valid: bool
}

struct ReferencePoint {
  // Owning quality area; None for fixed boundary/super-triangle points
  qual_est_area: Option<usize>,
  ref_block: Option<Image>,
  positions: Vec<FramePos>,
  last_valid_pos_idx: Option<usize>,
  has_matched_once: bool,
  last_transl_len: f64,
  last_transl_sqr_len: f64
}

#[derive(Clone, Copy, Default)]
struct TranslationStats {
  sum_len: f64,
  sum_sqr_len: f64,
  count: usize
}

pub struct RefPointAlignment<'a> {
  qual: &'a QualityEstimation<'a>,
  params: RefPtParams,
  points: Vec<ReferencePoint>,
  triangulation: Triangulation,
  // [triangle][active frame] sum of the three vertices' tile qualities
  tri_quality: Array2D<f32>,
  // Per-triangle acceptance threshold derived from the criterion
  tri_threshold: Vec<f32>,
  stats_ring: [TranslationStats; STATS_WINDOW],
  stats_next: usize,
  stats_len: usize,
  curr_frame: usize,
  is_complete: bool
}

impl<'a> RefPointAlignment<'a> {
  pub fn init(seq: &mut ImageSequence, qual: &'a QualityEstimation<'a>,
              params: RefPtParams) -> Result<RefPointAlignment<'a>> {
    if !qual.is_complete() {
      return Err(Error::InvalidParameters("quality estimation must be complete"));
    }
    if params.spacing < 6 {
      return Err(Error::InvalidParameters("reference point spacing too small"));
    }

    let ref_block_size = 2 * params.spacing / 3;
    let user_points = if params.positions.is_empty() {
      qual.suggest_reference_point_positions(params.brightness_threshold,
                                             params.structure_threshold,
                                             params.structure_scale,
                                             params.spacing,
                                             ref_block_size)?
    } else {
      params.positions.clone()
    };
    if user_points.is_empty() {
      return Err(Error::InvalidParameters("no usable reference points"));
    }

    let isec = qual.intersection();
    let num_tracked = user_points.len();
    let mut mesh_points = user_points;
    append_boundary_points(&mut mesh_points, isec.width, isec.height);

    // Envelope spans the boundary fence; the triangulator adds its own
    // super-triangle margin on top
    let w = isec.width as i32;
    let h = isec.height as i32;
    let envelope = Rect::new(-w / 4, -h / 4,
                             (w + w / 2) as u32, (h + h / 2) as u32);
    let triangulation = find_delaunay_triangulation(&mesh_points, envelope)?;

    let num_frames = qual.num_frames();
    let mut points = Vec::with_capacity(triangulation.vertices().len());
    for (i, &pos) in triangulation.vertices().iter().enumerate() {
      // Boundary fence and super-triangle vertices stay fixed
      let is_fixed = i >= num_tracked;
      points.push(ReferencePoint {
        qual_est_area: if is_fixed { None } else { Some(qual.area_index_at(pos)) },
        ref_block: None,
        positions: Vec::with_capacity(num_frames),
        last_valid_pos_idx: if is_fixed { Some(0) } else { None },
        has_matched_once: false,
        last_transl_len: 0.0,
        last_transl_sqr_len: 0.0
      });
    }
    info!(target: "refpt", "{} reference points ({} tracked), {} triangles",
          points.len(), num_tracked, triangulation.triangles().len());

    let (tri_quality, tri_threshold) =
      compute_triangle_quality(qual, &triangulation, &points, params.quality_criterion);

    let mut aligner = RefPointAlignment {
      qual: qual,
      params: params,
      points: points,
      triangulation: triangulation,
      tri_quality: tri_quality,
      tri_threshold: tri_threshold,
      stats_ring: [TranslationStats::default(); STATS_WINDOW],
      stats_next: 0,
      stats_len: 0,
      curr_frame: 0,
      is_complete: false
    };

    seq.seek_start()?;
    aligner.process_current_frame(seq)?;
    return Ok(aligner);
  }

  pub fn step(&mut self, seq: &mut ImageSequence) -> Result<StepResult> {
    match seq.seek_next() {
      Ok(()) => {},
      Err(Error::NoMoreImages) => {
        self.ensure_tris_are_valid();
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
    let mono = if img.pix_fmt() == PixelFormat::Mono8 {
      img
    } else {
      img.convert_pix_fmt(PixelFormat::Mono8, DemosaicMethod::Simple)?
    };
    let isec_pos = self.qual.alignment().intersection_in_frame(frame).pos();

    // Fill every point's slot for this frame with its previous position
    // (the placement position on frame 0); accepted matches overwrite
    // below. Fixed points are valid at their anchor position throughout.
    for (i, point) in self.points.iter_mut().enumerate() {
      let prev = match point.positions.last() {
        Some(fp) => fp.pos,
        None => self.triangulation.vertices()[i]
      };
      point.positions.push(FramePos { pos: prev, is_valid: point.qual_est_area.is_none() });
    }

    let search_radius = self.params.spacing / 2;
    let ref_block_size = 2 * self.params.spacing / 3;
    let max_first_shift = (self.params.spacing / 6) as i64;

    let mut updated = vec![false; self.points.len()];
    let mut accepted: Vec<(usize, Option<usize>, f64)> = Vec::new();
    let mut frame_stats = TranslationStats::default();

    for (t_idx, tri) in self.triangulation.triangles().iter().enumerate() {
      if self.tri_quality[t_idx][frame] < self.tri_threshold[t_idx] {
        continue;
      }
      for &p_idx in &tri.v {
        if updated[p_idx] {
          continue;
        }
        updated[p_idx] = true;

        let point = &mut self.points[p_idx];
        if point.qual_est_area.is_none() {
          continue; // fixed points do not track
        }

        let prev_pos = point.positions[frame].pos;
        if point.ref_block.is_none() {
          match self.qual.create_reference_block(prev_pos, ref_block_size) {
            Ok(block) => point.ref_block = Some(block),
            Err(_) => continue // point's neighbourhood is unusable
          }
        }

        let found = find_matching_position(prev_pos + isec_pos,
                                           point.ref_block.as_ref().unwrap(),
                                           &mono, search_radius, POINT_SEARCH_STEP);
        let new_pos = found - isec_pos;

        if !point.has_matched_once {
          // A first match jumping away from the placement position is a
          // mismatch, not seeing; drop it before it poisons the track
          let shift = new_pos.sqr_dist(prev_pos);
          if shift > max_first_shift * max_first_shift {
            continue;
          }
        }

        let last_valid = point.last_valid_pos_idx
          .map(|i| point.positions[i].pos)
          .unwrap_or(prev_pos);
        let transl = new_pos - last_valid;
        let sqr_len = (transl.x as f64).powi(2) + (transl.y as f64).powi(2);
        let len = sqr_len.sqrt();

        point.positions[frame] = FramePos { pos: new_pos, is_valid: true };
        let prev_last_valid = point.last_valid_pos_idx;
        point.last_valid_pos_idx = Some(frame);
        point.has_matched_once = true;
        point.last_transl_len = len;
        point.last_transl_sqr_len = sqr_len;

        frame_stats.sum_len += len;
        frame_stats.sum_sqr_len += sqr_len;
        frame_stats.count += 1;
        accepted.push((p_idx, prev_last_valid, len));
      }
    }

    self.reject_outliers(frame, &mut frame_stats, &accepted);

    // The (possibly reduced) aggregate enters the ring buffer
    self.stats_ring[self.stats_next] = frame_stats;
    self.stats_next = (self.stats_next + 1) % STATS_WINDOW;
    self.stats_len = (self.stats_len + 1).min(STATS_WINDOW);

    debug!(target: "refpt", "frame {}: {} point updates", frame, frame_stats.count);
    return Ok(());
  }

  // Translations far beyond the recent-window distribution are reverted:
  // the point goes back to its previous position and drops out of the
  // current frame's aggregate
  fn reject_outliers(&mut self, frame: usize, frame_stats: &mut TranslationStats,
                     accepted: &[(usize, Option<usize>, f64)]) {
    let mut sum = frame_stats.sum_len;
    let mut sum_sqr = frame_stats.sum_sqr_len;
    let mut count = frame_stats.count;
    for i in 0..self.stats_len {
      sum += self.stats_ring[i].sum_len;
      sum_sqr += self.stats_ring[i].sum_sqr_len;
      count += self.stats_ring[i].count;
    }
    if count == 0 {
      return;
    }

    let mean = sum / count as f64;
    let variance = (sum_sqr / count as f64 - mean * mean).max(0.0);
    let limit = mean + OUTLIER_SIGMAS * variance.sqrt();

    for &(p_idx, prev_last_valid, len) in accepted {
      if len <= limit {
        continue;
      }
      let prev_pos = if frame > 0 {
        self.points[p_idx].positions[frame - 1].pos
      } else {
        self.triangulation.vertices()[p_idx]
      };
      let point = &mut self.points[p_idx];
      point.positions[frame] = FramePos { pos: prev_pos, is_valid: false };
      point.last_valid_pos_idx = prev_last_valid;

      frame_stats.sum_len -= len;
      frame_stats.sum_sqr_len -= len * len;
      frame_stats.count -= 1;
      debug!(target: "refpt", "outlier reverted: point {} moved {:.1} (limit {:.1})",
             p_idx, len, limit);
    }
  }

  // Guarantee that every triangle has at least one frame in which all of
  // its vertices are valid, so stacking always finds a source
  fn ensure_tris_are_valid(&mut self) {
    let num_frames = self.qual.num_frames();
    let mut repaired = 0usize;

    for (t_idx, tri) in self.triangulation.triangles().iter().enumerate() {
      let all_valid_somewhere = (0..num_frames).any(|f| {
        tri.v.iter().all(|&p| self.points[p].positions[f].is_valid)
      });
      if all_valid_somewhere {
        continue;
      }

      let mut best_frame = 0;
      for f in 1..num_frames {
        if self.tri_quality[t_idx][f] > self.tri_quality[t_idx][best_frame] {
          best_frame = f;
        }
      }
      for &p in &tri.v {
        self.points[p].positions[best_frame].is_valid = true;
      }
      repaired += 1;
    }
    if repaired > 0 {
      info!(target: "refpt", "{} triangles force-validated on their best frames", repaired);
    }
  }

  pub fn is_complete(&self) -> bool {
    self.is_complete
  }

  pub fn quality_est(&self) -> &QualityEstimation<'a> {
    self.qual
  }

  pub fn triangulation(&self) -> &Triangulation {
    &self.triangulation
  }

  pub fn num_points(&self) -> usize {
    self.points.len()
  }

  pub fn point_pos(&self, point_idx: usize, frame: usize) -> (Point, bool) {
    let fp = self.points[point_idx].positions[frame];
    (fp.pos, fp.is_valid)
  }

  // Mean of all valid positions across the active frames
  pub fn final_position(&self, point_idx: usize) -> PointF {
    let point = &self.points[point_idx];
    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    let mut n = 0usize;
    for fp in &point.positions {
      if fp.is_valid {
        sum_x += fp.pos.x as f64;
        sum_y += fp.pos.y as f64;
        n += 1;
      }
    }
    if n == 0 {
      let p = self.triangulation.vertices()[point_idx];
      return PointF::new(p.x as f32, p.y as f32);
    }
    PointF::new((sum_x / n as f64) as f32, (sum_y / n as f64) as f32)
  }
}

// Four fixed points along each side of the intersection, pushed outward
// by a quarter of the perpendicular dimension; they fence the mesh so no
// skinny triangle leans on the border
fn append_boundary_points(points: &mut Vec<Point>, width: u32, height: u32) {
  let w = width as i32;
  let h = height as i32;
  for i in 0..BOUNDARY_POINTS_PER_SIDE {
    let fx = i * w / (BOUNDARY_POINTS_PER_SIDE - 1);
    let fy = i * h / (BOUNDARY_POINTS_PER_SIDE - 1);
    points.push(Point::new(fx, -h / 4));     // top
    points.push(Point::new(fx, h + h / 4));  // bottom
    points.push(Point::new(-w / 4, fy));     // left
    points.push(Point::new(w + w / 4, fy));  // right
  }
}

fn compute_triangle_quality(qual: &QualityEstimation, triangulation: &Triangulation,
                            points: &[ReferencePoint], criterion: QualityCriterion)
                            -> (Array2D<f32>, Vec<f32>) {
  let num_frames = qual.num_frames();
  let num_tris = triangulation.triangles().len();
  let mut tri_quality: Array2D<f32> = Array2D::zeroed(num_tris, num_frames);
  let mut tri_threshold = vec![0.0f32; num_tris];

  for (t_idx, tri) in triangulation.triangles().iter().enumerate() {
    for f in 0..num_frames {
      let mut sum = 0.0f32;
      for &p in &tri.v {
        if let Some(area) = points[p].qual_est_area {
          sum += qual.area_quality(area, f);
        }
      }
      tri_quality[t_idx][f] = sum;
    }

    let mut sorted: Vec<f32> = tri_quality[t_idx].to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    tri_threshold[t_idx] = match criterion {
      QualityCriterion::PercentageBest(k) => {
        // Acceptance is quality >= the value at rank 0.01*(100-k)*N
        let idx = (0.01 * (100 - k.min(100)) as f64 * num_frames as f64) as usize;
        sorted[idx.min(num_frames - 1)]
      },
      QualityCriterion::NumberBest(k) => {
        let idx = num_frames.saturating_sub((k.max(1)) as usize);
        sorted[idx.min(num_frames - 1)]
      },
      QualityCriterion::MinRelQuality(k) => {
        let min = sorted[0];
        let max = sorted[num_frames - 1];
        min + 0.01 * k * (max - min)
      }
    };
  }
  return (tri_quality, tri_threshold);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::align::{AlignmentMethod, ImgAlignment};
  use crate::bmp;
  use crate::quality::QualityEstParams;
  use tempfile::tempdir;

  fn noise_frame(width: u32, height: u32, shift: i32) -> Image {
    let mut img = Image::new(width, height, PixelFormat::Mono8, None).unwrap();
    for y in 0..height {
      for x in 0..width {
        let sx = (x as i32 - shift).rem_euclid(width as i32) as u32;
        let v = (sx.wrapping_mul(73) ^ y.wrapping_mul(151)).wrapping_mul(13) % 251;
        img.line_mut(y)[x as usize] = v as u8;
      }
    }
    return img;
  }

  fn noise_sequence(dir: &std::path::Path, shifts: &[i32]) -> ImageSequence {
    let mut paths = Vec::new();
    for (i, &s) in shifts.iter().enumerate() {
      let path = dir.join(format!("r{}.bmp", i));
      bmp::save_bmp(&noise_frame(128, 128, s), &path).unwrap();
      paths.push(path);
    }
    ImageSequence::from_image_list(paths).unwrap()
  }

  fn run_to_completion(dir: &std::path::Path, shifts: &[i32], params: RefPtParams)
                       -> (Vec<Point>, Vec<PointF>, usize) {
    let mut seq = noise_sequence(dir, shifts);
    let mut align = ImgAlignment::init(&mut seq, AlignmentMethod::Centroid).unwrap();
    while align.step(&mut seq).unwrap() == StepResult::More {}
    let mut qual = QualityEstimation::init(&mut seq, &align, QualityEstParams::default()).unwrap();
    while qual.step(&mut seq).unwrap() == StepResult::More {}

    let initial = params.positions.clone();
    let mut refpt = RefPointAlignment::init(&mut seq, &qual, params).unwrap();
    while refpt.step(&mut seq).unwrap() == StepResult::More {}
    assert!(refpt.is_complete());

    // Every triangle must have a frame where all vertices are valid
    let num_frames = qual.num_frames();
    for tri in refpt.triangulation().triangles() {
      let ok = (0..num_frames).any(|f| {
        tri.v.iter().all(|&p| refpt.point_pos(p, f).1)
      });
      assert!(ok, "triangle {:?} has no fully valid frame", tri.v);
    }

    let finals = (0..initial.len()).map(|i| refpt.final_position(i)).collect();
    (initial, finals, refpt.num_points())
  }

  #[test]
  fn identical_frames_keep_points_in_place() {
    let dir = tempdir().unwrap();
    let params = RefPtParams {
      positions: vec![Point::new(40, 40), Point::new(80, 50), Point::new(50, 88)],
      quality_criterion: QualityCriterion::PercentageBest(100),
      spacing: 24,
      ..Default::default()
    };
    let (initial, finals, num_points) = run_to_completion(dir.path(), &[0, 0, 0], params);

    // 3 user points + 16 boundary + 3 super-triangle vertices
    assert_eq!(num_points, 3 + 16 + 3);
    for (init, fin) in initial.iter().zip(finals.iter()) {
      assert!((fin.x - init.x as f32).abs() < 0.5, "{:?} vs {:?}", init, fin);
      assert!((fin.y - init.y as f32).abs() < 0.5, "{:?} vs {:?}", init, fin);
    }
  }

  #[test]
  fn global_shift_is_absorbed_by_alignment() {
    // With anchor alignment compensating the drift, points keep their
    // intersection-space positions throughout a shift-only sequence
    let dir = tempdir().unwrap();
    let mut seq = noise_sequence(dir.path(), &[0, 2, 4]);
    let config = crate::align::AnchorConfig {
      block_radius: 10, search_radius: 8, ..Default::default()
    };
    let mut align = ImgAlignment::init(&mut seq, AlignmentMethod::Anchors(config)).unwrap();
    while align.step(&mut seq).unwrap() == StepResult::More {}
    assert_eq!(align.frame_offset(1), Point::new(2, 0));
    assert_eq!(align.frame_offset(2), Point::new(4, 0));

    let mut qual = QualityEstimation::init(&mut seq, &align, QualityEstParams::default()).unwrap();
    while qual.step(&mut seq).unwrap() == StepResult::More {}

    let initial = vec![Point::new(40, 40), Point::new(70, 60)];
    let params = RefPtParams {
      positions: initial.clone(),
      quality_criterion: QualityCriterion::PercentageBest(100),
      spacing: 24,
      ..Default::default()
    };
    let mut refpt = RefPointAlignment::init(&mut seq, &qual, params).unwrap();
    while refpt.step(&mut seq).unwrap() == StepResult::More {}

    for (i, init) in initial.iter().enumerate() {
      let fin = refpt.final_position(i);
      assert!((fin.x - init.x as f32).abs() < 0.5, "{:?} vs {:?}", init, fin);
      assert!((fin.y - init.y as f32).abs() < 0.5, "{:?} vs {:?}", init, fin);
    }
  }

  #[test]
  fn criterion_thresholds_rank_frames() {
    // Synthetic check of the acceptance conventions
    let sorted = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];

    // PercentageBest(30): idx = 0.01 * 70 * 10 = 7 -> threshold 8.0
    let idx = (0.01 * 70.0 * 10.0) as usize;
    assert_eq!(sorted[idx], 8.0);

    // NumberBest(3): idx = 10 - 3 -> threshold 8.0
    assert_eq!(sorted[10 - 3], 8.0);
  }
}
