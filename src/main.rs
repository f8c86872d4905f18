// Command-line driver for the four-stage stacking pipeline

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use log::info;

use tinystacker::align::{AlignmentMethod, AnchorConfig, ImgAlignment};
use tinystacker::bmp::save_bmp;
use tinystacker::demosaic::CfaPattern;
use tinystacker::error::{Error, Result, StepResult};
use tinystacker::image::{Image, PixelFormat};
use tinystacker::imgseq::ImageSequence;
use tinystacker::quality::{QualityEstParams, QualityEstimation};
use tinystacker::refpt::{QualityCriterion, RefPointAlignment, RefPtParams};
use tinystacker::stacking::Stacking;
use tinystacker::tiff::{load_tiff, save_tiff};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum AlignmentArg {
  Anchors,
  Centroid
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum CriterionArg {
  PercentageBest,
  MinRelQuality,
  NumberBest
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum CfaArg {
  Rggb,
  Grbg,
  Gbrg,
  Bggr
}

#[derive(Parser, Debug)]
#[command(name = "tinystacker",
          about = "Stack the sharpest fragments of an astronomical video into one image")]
struct Args {
  // One video file (.avi/.ser) or several still images (.bmp/.tif)
  #[arg(required = true)]
  input: Vec<PathBuf>,

  // Output image; 16-bit TIFF unless the extension says .bmp
  #[arg(short, long)]
  output: Option<PathBuf>,

  #[arg(long, value_enum, default_value_t = AlignmentArg::Anchors)]
  alignment: AlignmentArg,

  // Anchor tracking block radius (pixels)
  #[arg(long, default_value_t = 32)]
  block_radius: u32,

  // Anchor search radius per frame (pixels)
  #[arg(long, default_value_t = 32)]
  search_radius: u32,

  // Quality estimation tile size (pixels)
  #[arg(long, default_value_t = 40)]
  tile_size: u32,

  // Blur radius of the sharpness metric
  #[arg(long, default_value_t = 3)]
  detail_radius: u32,

  // Reference point grid spacing (pixels)
  #[arg(long, default_value_t = 40)]
  spacing: u32,

  // Minimum structure fitness for automatic reference points
  #[arg(long, default_value_t = 1.2)]
  structure_threshold: f32,

  // Scale (pixels) at which structure is measured
  #[arg(long, default_value_t = 2)]
  structure_scale: u32,

  // Relative brightness cut-off for anchor/point placement
  #[arg(long, default_value_t = 0.33)]
  brightness_threshold: f32,

  #[arg(long, value_enum, default_value_t = CriterionArg::PercentageBest)]
  criterion: CriterionArg,

  // Meaning depends on --criterion: percent of frames, relative quality
  // percent, or a frame count
  #[arg(long, default_value_t = 30.0)]
  criterion_value: f32,

  // Flatfield exposure to divide out vignetting
  #[arg(long)]
  flat: Option<PathBuf>,

  // Treat mono input frames as raw Bayer data with this pattern
  #[arg(long, value_enum)]
  cfa: Option<CfaArg>,

  // Keep only every n-th frame
  #[arg(long, default_value_t = 1)]
  skip: usize
}

fn open_sequence(args: &Args) -> Result<ImageSequence> {
  let ext = args.input[0].extension()
    .map(|e| e.to_string_lossy().to_ascii_lowercase())
    .unwrap_or_default();

  let mut seq = if args.input.len() == 1 && (ext == "avi" || ext == "ser") {
    ImageSequence::open_video(&args.input[0])?
  } else {
    ImageSequence::from_image_list(args.input.clone())?
  };

  if args.skip > 1 {
    let flags = (0..seq.count()).map(|i| i % args.skip == 0).collect();
    seq.set_active_flags(flags)?;
  }
  if let Some(cfa) = args.cfa {
    seq.set_cfa_override(Some(match cfa {
      CfaArg::Rggb => CfaPattern::Rggb,
      CfaArg::Grbg => CfaPattern::Grbg,
      CfaArg::Gbrg => CfaPattern::Gbrg,
      CfaArg::Bggr => CfaPattern::Bggr
    }));
  }
  return Ok(seq);
}

// The flatfield may be a single exposure or a whole flat video to average
fn load_flatfield(path: &PathBuf) -> Result<Image> {
  let ext = path.extension()
    .map(|e| e.to_string_lossy().to_ascii_lowercase())
    .unwrap_or_default();
  match ext.as_str() {
    "bmp" => tinystacker::bmp::load_bmp(path),
    "tif" | "tiff" => load_tiff(path),
    "avi" | "ser" => {
      let mut flat_seq = ImageSequence::open_video(path)?;
      tinystacker::stacking::mean_image_of_sequence(&mut flat_seq)
    },
    _ => Err(Error::UnsupportedFileFormat(path.display().to_string()))
  }
}

fn save_output(stack: &Image, path: &PathBuf) -> Result<()> {
  use tinystacker::demosaic::DemosaicMethod;

  let ext = path.extension()
    .map(|e| e.to_string_lossy().to_ascii_lowercase())
    .unwrap_or_default();

  if ext == "bmp" {
    let fmt = if stack.pix_fmt() == PixelFormat::Mono32f {
      PixelFormat::Mono8
    } else {
      PixelFormat::Rgb8
    };
    save_bmp(&stack.convert_pix_fmt(fmt, DemosaicMethod::HqLinear)?, path)
  } else {
    let fmt = if stack.pix_fmt() == PixelFormat::Mono32f {
      PixelFormat::Mono16
    } else {
      PixelFormat::Rgb16
    };
    save_tiff(&stack.convert_pix_fmt(fmt, DemosaicMethod::HqLinear)?, path)
  }
}

fn run(args: &Args) -> Result<()> {
  let total_start = Instant::now();
  let mut seq = open_sequence(args)?;
  info!("{} frames ({} active)", seq.count(), seq.active_count());

  let method = match args.alignment {
    AlignmentArg::Anchors => AlignmentMethod::Anchors(AnchorConfig {
      positions: Vec::new(),
      block_radius: args.block_radius,
      search_radius: args.search_radius,
      brightness_threshold: args.brightness_threshold
    }),
    AlignmentArg::Centroid => AlignmentMethod::Centroid
  };

  let stage_start = Instant::now();
  let mut align = ImgAlignment::init(&mut seq, method)?;
  while align.step(&mut seq)? == StepResult::More {}
  info!("image alignment: {:.2} s", stage_start.elapsed().as_secs_f64());

  let stage_start = Instant::now();
  let mut qual = QualityEstimation::init(&mut seq, &align, QualityEstParams {
    area_size: args.tile_size,
    detail_radius: args.detail_radius,
    legacy_brightness_stats: false
  })?;
  while qual.step(&mut seq)? == StepResult::More {}
  info!("quality estimation: {:.2} s", stage_start.elapsed().as_secs_f64());

  let criterion = match args.criterion {
    CriterionArg::PercentageBest => QualityCriterion::PercentageBest(args.criterion_value as u32),
    CriterionArg::MinRelQuality => QualityCriterion::MinRelQuality(args.criterion_value),
    CriterionArg::NumberBest => QualityCriterion::NumberBest(args.criterion_value as u32)
  };

  let stage_start = Instant::now();
  let mut refpt = RefPointAlignment::init(&mut seq, &qual, RefPtParams {
    positions: Vec::new(),
    quality_criterion: criterion,
    spacing: args.spacing,
    structure_threshold: args.structure_threshold,
    structure_scale: args.structure_scale,
    brightness_threshold: args.brightness_threshold
  })?;
  while refpt.step(&mut seq)? == StepResult::More {}
  info!("reference-point alignment: {:.2} s", stage_start.elapsed().as_secs_f64());

  let flat = match &args.flat {
    Some(path) => Some(load_flatfield(path)?),
    None => None
  };

  let stage_start = Instant::now();
  let mut stacking = Stacking::init(&mut seq, &refpt, flat.as_ref())?;
  while stacking.step(&mut seq)? == StepResult::More {}
  info!("stacking: {:.2} s", stage_start.elapsed().as_secs_f64());

  let output = match &args.output {
    Some(path) => path.clone(),
    None => args.input[0].with_extension("stacked.tif")
  };
  save_output(&stacking.image_stack()?, &output)?;
  info!("saved {} ({:.2} s total)", output.display(), total_start.elapsed().as_secs_f64());
  return Ok(());
}

fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  let args = Args::parse();
  if let Err(err) = run(&args) {
    eprintln!("error: {}", err);
    std::process::exit(1);
  }
}
