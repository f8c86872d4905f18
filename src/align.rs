// Stage 1: global translational alignment of the sequence
//
// Two methods: anchor tracking (block matching of one or more reference
// blocks picked on the first frame) and brightness-centroid tracking
// (image moments). Either way the result is one translation per active
// frame, relative to the first, plus the intersection of all frames
// after those translations.

use log::{debug, info};

use crate::blockmatch::find_matching_position;
use crate::demosaic::DemosaicMethod;
use crate::error::{Error, Result, StepResult};
use crate::filters::estimate_quality;
use crate::geom::{Point, Rect};
use crate::image::{Image, PixelFormat};
use crate::imgseq::ImageSequence;

// Detail radius used when scoring anchor candidate blocks
const ANCHOR_QUALITY_RADIUS: u32 = 4;
// Initial block-matcher search step for anchors
const ANCHOR_SEARCH_STEP: u32 = 4;

#[derive(Clone, Debug)]
pub struct AnchorConfig {
  // Anchor positions on the first frame; empty selects one automatically
  pub positions: Vec<Point>,
  pub block_radius: u32,
  pub search_radius: u32,
  // Relative brightness cut-off used when placing anchors automatically
  pub brightness_threshold: f32
}

impl Default for AnchorConfig {
  fn default() -> Self {
    AnchorConfig {
      positions: Vec::new(),
      block_radius: 32,
      search_radius: 32,
      brightness_threshold: 0.33
    }
  }
}

#[derive(Clone, Debug)]
pub enum AlignmentMethod {
  Anchors(AnchorConfig),
  Centroid
}

struct Anchor {
  pos: Point,
  is_valid: bool,
  ref_block: Image,
  ref_quality: f32
}

enum MethodState {
  Anchors {
    config: AnchorConfig,
    anchors: Vec<Anchor>,
    active_idx: usize
  },
  Centroid {
    first_centroid: (f64, f64)
  }
}

pub struct ImgAlignment {
  method: MethodState,
  // Drift of each active frame relative to the first one
  offsets: Vec<Point>,
  // Intersection of all frame rectangles, in first-frame coordinates
  intersection: Rect,
  is_complete: bool
}

fn to_mono8(img: &Image) -> Result<Image> {
  if img.pix_fmt() == PixelFormat::Mono8 {
    return Ok(img.clone());
  }
  img.convert_pix_fmt(PixelFormat::Mono8, DemosaicMethod::Simple)
}

fn brightness_range(img: &Image) -> (u8, u8) {
  let mut bmin = u8::MAX;
  let mut bmax = u8::MIN;
  for &v in img.pixels() {
    bmin = bmin.min(v);
    bmax = bmax.max(v);
  }
  (bmin, bmax)
}

// Pick the position of the sharpest non-overexposed block on a frame.
// The middle 3/4 of the frame is scanned on a grid with step
// block_size/3; a candidate block qualifies if at least 20% of its
// pixels are unsaturated yet brighter than the relative threshold.
pub fn suggest_anchor_pos(img: &Image, brightness_threshold: f32, block_size: u32) -> Point {
  let width = img.width();
  let height = img.height();
  let (bmin, bmax) = brightness_range(img);
  let min_accepted = bmin as f32 + brightness_threshold * (bmax - bmin) as f32;
  let step = (block_size / 3).max(1);

  let mut best_pos = Point::new(width as i32 / 2, height as i32 / 2);
  let mut best_quality = 0.0f32;

  let mut y = height / 8;
  while y + block_size <= height - height / 8 {
    let mut x = width / 8;
    while x + block_size <= width - width / 8 {
      let block = img.fragment(Rect::new(x as i32, y as i32, block_size, block_size)).unwrap();

      let num_eligible = block.pixels().iter()
        .filter(|&&v| v < 0xFF && v as f32 > min_accepted)
        .count();
      if 5 * num_eligible >= block.pixels().len() {
        let quality = estimate_quality(&block, ANCHOR_QUALITY_RADIUS).unwrap_or(0.0);
        if quality > best_quality {
          best_quality = quality;
          best_pos = Point::new(x as i32 + block_size as i32 / 2,
                                y as i32 + block_size as i32 / 2);
        }
      }
      x += step;
    }
    y += step;
  }
  debug!(target: "align", "anchor suggested at ({}, {}), quality {}",
         best_pos.x, best_pos.y, best_quality);
  return best_pos;
}

fn make_anchor(mono: &Image, pos: Point, block_radius: u32) -> Result<Anchor> {
  let block_size = 2 * block_radius;
  let block = mono.resize_and_translate(pos.x - block_radius as i32,
                                        pos.y - block_radius as i32,
                                        block_size, block_size,
                                        0, 0, block_size, block_size, true)?;
  let quality = estimate_quality(&block, ANCHOR_QUALITY_RADIUS)?;
  Ok(Anchor {
    pos: pos,
    is_valid: true,
    ref_block: block,
    ref_quality: quality
  })
}

fn centroid(mono: &Image) -> (f64, f64) {
  let mut m00 = 0u64;
  let mut m10 = 0u64;
  let mut m01 = 0u64;
  for y in 0..mono.height() {
    let line = mono.line(y);
    for x in 0..mono.width() {
      let v = line[x as usize] as u64;
      m00 += v;
      m10 += v * x as u64;
      m01 += v * y as u64;
    }
  }
  if m00 == 0 {
    // A black frame has no meaningful centroid; report the center
    return (mono.width() as f64 / 2.0, mono.height() as f64 / 2.0);
  }
  (m10 as f64 / m00 as f64, m01 as f64 / m00 as f64)
}

impl ImgAlignment {
  // Reads the first active frame to set up tracking state; the sequence
  // is left positioned there, ready for step()
  pub fn init(seq: &mut ImageSequence, method: AlignmentMethod) -> Result<ImgAlignment> {
    seq.seek_start()?;
    let first = seq.current_image()?;
    let mono = to_mono8(&first)?;

    let method_state = match method {
      AlignmentMethod::Anchors(config) => {
        if config.block_radius == 0 || config.search_radius == 0 {
          return Err(Error::InvalidParameters("anchor radii must be positive"));
        }
        let positions = if config.positions.is_empty() {
          vec![suggest_anchor_pos(&mono, config.brightness_threshold, 2 * config.block_radius)]
        } else {
          config.positions.clone()
        };
        let mut anchors = Vec::with_capacity(positions.len());
        for &pos in &positions {
          anchors.push(make_anchor(&mono, pos, config.block_radius)?);
        }
        info!(target: "align", "tracking {} anchor(s)", anchors.len());
        MethodState::Anchors {
          config: config,
          anchors: anchors,
          active_idx: 0
        }
      },
      AlignmentMethod::Centroid => {
        MethodState::Centroid { first_centroid: centroid(&mono) }
      }
    };

    Ok(ImgAlignment {
      method: method_state,
      offsets: vec![Point::new(0, 0)],
      intersection: Rect::new(0, 0, first.width(), first.height()),
      is_complete: false
    })
  }

  // Process the next active frame. Returns LastStep once the sequence is
  // exhausted; after that the offsets and the intersection are final.
  pub fn step(&mut self, seq: &mut ImageSequence) -> Result<StepResult> {
    match seq.seek_next() {
      Ok(()) => {},
      Err(Error::NoMoreImages) => {
        self.is_complete = true;
        info!(target: "align", "alignment complete, intersection {}x{} at ({}, {})",
              self.intersection.width, self.intersection.height,
              self.intersection.x, self.intersection.y);
        return Ok(StepResult::LastStep);
      },
      Err(e) => return Err(e)
    }

    let img = seq.current_image()?;
    let mono = to_mono8(&img)?;

    let prev_offset = *self.offsets.last().unwrap();
    let delta = match &mut self.method {
      MethodState::Anchors { config, anchors, active_idx } => {
        step_anchors(&mono, config, anchors, active_idx)?
      },
      MethodState::Centroid { first_centroid } => {
        let c = centroid(&mono);
        let abs = Point::new((c.0 - first_centroid.0).round() as i32,
                             (c.1 - first_centroid.1).round() as i32);
        abs - prev_offset
      }
    };

    let offset = prev_offset + delta;
    self.offsets.push(offset);
    debug!(target: "align", "frame {}: offset ({}, {})",
           seq.current_active_index(), offset.x, offset.y);

    // Frame k covers, in first-frame coordinates, the rectangle of its
    // size positioned at -offset
    self.intersection = self.intersection
      .intersect(&Rect::new(-offset.x, -offset.y, img.width(), img.height()));
    if self.intersection.is_empty() {
      return Err(Error::InvalidParameters("frames drifted apart, empty intersection"));
    }
    return Ok(StepResult::More);
  }

  pub fn is_complete(&self) -> bool {
    self.is_complete
  }

  pub fn num_frames(&self) -> usize {
    self.offsets.len()
  }

  // Drift of the given active frame relative to the first one
  pub fn frame_offset(&self, active_frame_idx: usize) -> Point {
    self.offsets[active_frame_idx]
  }

  // Intersection of all frames, in first-frame coordinates
  pub fn intersection(&self) -> Rect {
    self.intersection
  }

  // The intersection rectangle as positioned within the given frame
  pub fn intersection_in_frame(&self, active_frame_idx: usize) -> Rect {
    let ofs = self.offsets[active_frame_idx];
    Rect::new(self.intersection.x + ofs.x, self.intersection.y + ofs.y,
              self.intersection.width, self.intersection.height)
  }
}

fn step_anchors(mono: &Image, config: &AnchorConfig,
                anchors: &mut Vec<Anchor>, active_idx: &mut usize) -> Result<Point> {
  let block_size = 2 * config.block_radius;
  let edge_limit = (config.search_radius + block_size) as i32;
  let mut active_delta = Point::new(0, 0);

  for i in 0..anchors.len() {
    if !anchors[i].is_valid {
      continue;
    }
    let old_pos = anchors[i].pos;
    let new_pos = find_matching_position(old_pos, &anchors[i].ref_block, mono,
                                         config.search_radius, ANCHOR_SEARCH_STEP);
    if i == *active_idx {
      active_delta = new_pos - old_pos;
    }
    anchors[i].pos = new_pos;

    if new_pos.x < edge_limit || new_pos.y < edge_limit
       || new_pos.x >= mono.width() as i32 - edge_limit
       || new_pos.y >= mono.height() as i32 - edge_limit {
      anchors[i].is_valid = false;
      debug!(target: "align", "anchor {} left the usable area, dropped", i);
      continue;
    }

    // Adopt the current frame's block as the new reference if it is
    // sharper than what we have been tracking
    let block = mono.resize_and_translate(new_pos.x - config.block_radius as i32,
                                          new_pos.y - config.block_radius as i32,
                                          block_size, block_size,
                                          0, 0, block_size, block_size, true)?;
    let quality = estimate_quality(&block, ANCHOR_QUALITY_RADIUS)?;
    if quality > anchors[i].ref_quality {
      anchors[i].ref_block = block;
      anchors[i].ref_quality = quality;
    }
  }

  if !anchors[*active_idx].is_valid {
    match anchors.iter().position(|a| a.is_valid) {
      Some(next) => {
        *active_idx = next;
        debug!(target: "align", "switched to anchor {}", next);
      },
      None => {
        // All anchors lost: synthesize a fresh one on the current frame
        let pos = suggest_anchor_pos(mono, config.brightness_threshold, block_size);
        anchors.push(make_anchor(mono, pos, config.block_radius)?);
        *active_idx = anchors.len() - 1;
        info!(target: "align", "all anchors lost, placed a new one at ({}, {})", pos.x, pos.y);
      }
    }
  }
  return Ok(active_delta);
}
