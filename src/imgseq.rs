// Image sequences: an ordered, finite run of frames from a video file or
// a list of still images, with a per-frame active flag. Stages iterate
// only over the active subset; the flags let the driver decimate or
// hand-pick frames without touching the underlying files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::avi::AviFile;
use crate::bmp;
use crate::demosaic::CfaPattern;
use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat};
use crate::ser::SerFile;
use crate::tiff;

static NEXT_SEQUENCE_ID: AtomicU64 = AtomicU64::new(1);

enum Provider {
  ImageList(Vec<PathBuf>),
  Ser(SerFile),
  Avi(AviFile)
}

pub struct ImageSequence {
  id: u64,
  provider: Provider,
  active: Vec<bool>,
  curr_idx: usize,
  curr_active_idx: usize,
  cfa_override: Option<CfaPattern>
}

fn extension_of(path: &Path) -> String {
  path.extension()
    .map(|e| e.to_string_lossy().to_ascii_lowercase())
    .unwrap_or_default()
}

fn load_list_image(path: &Path) -> Result<Image> {
  match extension_of(path).as_str() {
    "bmp" => bmp::load_bmp(path),
    "tif" | "tiff" => tiff::load_tiff(path),
    _ => Err(Error::UnsupportedFileFormat(path.display().to_string()))
  }
}

fn list_image_metadata(path: &Path) -> Result<(u32, u32, PixelFormat)> {
  match extension_of(path).as_str() {
    "bmp" => bmp::bmp_metadata(path),
    "tif" | "tiff" => tiff::tiff_metadata(path),
    _ => Err(Error::UnsupportedFileFormat(path.display().to_string()))
  }
}

impl ImageSequence {
  // Open a video file, dispatched by extension (.avi, .ser)
  pub fn open_video(path: &Path) -> Result<ImageSequence> {
    let provider = match extension_of(path).as_str() {
      "avi" => Provider::Avi(AviFile::open(path)?),
      "ser" => Provider::Ser(SerFile::open(path)?),
      _ => return Err(Error::UnsupportedFileFormat(path.display().to_string()))
    };
    Ok(Self::from_provider(provider))
  }

  pub fn from_image_list(paths: Vec<PathBuf>) -> Result<ImageSequence> {
    if paths.is_empty() {
      return Err(Error::InvalidParameters("empty image list"));
    }
    Ok(Self::from_provider(Provider::ImageList(paths)))
  }

  fn from_provider(provider: Provider) -> ImageSequence {
    let count = match &provider {
      Provider::ImageList(paths) => paths.len(),
      Provider::Ser(ser) => ser.frame_count(),
      Provider::Avi(avi) => avi.frame_count()
    };
    ImageSequence {
      id: NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed),
      provider: provider,
      active: vec![true; count],
      curr_idx: 0,
      curr_active_idx: 0,
      cfa_override: None
    }
  }

  // Stable identifier used as part of image-cache keys
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn count(&self) -> usize {
    self.active.len()
  }

  pub fn active_count(&self) -> usize {
    self.active.iter().filter(|&&a| a).count()
  }

  // Reinterpret mono frames as a raw Bayer mosaic at read time
  pub fn set_cfa_override(&mut self, pattern: Option<CfaPattern>) {
    self.cfa_override = pattern;
  }

  pub fn set_active_flags(&mut self, flags: Vec<bool>) -> Result<()> {
    if flags.len() != self.active.len() {
      return Err(Error::InvalidParameters("active flag count does not match frame count"));
    }
    if !flags.iter().any(|&a| a) {
      return Err(Error::InvalidParameters("at least one frame must stay active"));
    }
    self.active = flags;
    return Ok(());
  }

  pub fn is_active(&self, index: usize) -> bool {
    self.active[index]
  }

  pub fn seek_start(&mut self) -> Result<()> {
    match self.active.iter().position(|&a| a) {
      Some(idx) => {
        self.curr_idx = idx;
        self.curr_active_idx = 0;
        Ok(())
      },
      None => Err(Error::NoMoreImages)
    }
  }

  pub fn seek_next(&mut self) -> Result<()> {
    for idx in self.curr_idx + 1 .. self.active.len() {
      if self.active[idx] {
        self.curr_idx = idx;
        self.curr_active_idx += 1;
        return Ok(());
      }
    }
    return Err(Error::NoMoreImages);
  }

  pub fn current_index(&self) -> usize {
    self.curr_idx
  }

  // Position of the current frame within the active subset
  pub fn current_active_index(&self) -> usize {
    self.curr_active_idx
  }

  pub fn current_image(&mut self) -> Result<Image> {
    self.image_at(self.curr_idx)
  }

  pub fn image_at(&mut self, index: usize) -> Result<Image> {
    if index >= self.count() {
      return Err(Error::NoMoreImages);
    }
    let mut img = match &mut self.provider {
      Provider::ImageList(paths) => load_list_image(&paths[index])?,
      Provider::Ser(ser) => ser.frame_at(index)?,
      Provider::Avi(avi) => avi.frame_at(index)?
    };
    if let Some(pattern) = self.cfa_override {
      match img.pix_fmt() {
        PixelFormat::Mono8 | PixelFormat::Mono16 => img.reinterpret_as_cfa(pattern)?,
        fmt if fmt.is_cfa() => img.reinterpret_as_cfa(pattern)?,
        _ => {}
      }
    }
    return Ok(img);
  }

  pub fn current_metadata(&mut self) -> Result<(u32, u32, PixelFormat)> {
    self.metadata_at(self.curr_idx)
  }

  // Frame dimensions and storage format without decoding pixel data;
  // the CFA override shows through, matching what image_at would return
  pub fn metadata_at(&mut self, index: usize) -> Result<(u32, u32, PixelFormat)> {
    if index >= self.count() {
      return Err(Error::NoMoreImages);
    }
    let (w, h, mut fmt) = match &self.provider {
      Provider::ImageList(paths) => list_image_metadata(&paths[index])?,
      Provider::Ser(ser) => ser.metadata(),
      Provider::Avi(avi) => avi.metadata()
    };
    if let Some(pattern) = self.cfa_override {
      match fmt {
        PixelFormat::Mono8 | PixelFormat::Mono16 => {
          fmt = crate::image::cfa_format(pattern, fmt.bits_per_channel());
        },
        f if f.is_cfa() => {
          fmt = crate::image::cfa_format(pattern, f.bits_per_channel());
        },
        _ => {}
      }
    }
    Ok((w, h, fmt))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::PixelFormat;
  use tempfile::tempdir;

  fn write_gray_bmp(path: &Path, width: u32, height: u32, value: u8) {
    let data = vec![value; (width * height) as usize];
    let img = Image::from_pixels(width, height, PixelFormat::Mono8, None, data).unwrap();
    bmp::save_bmp(&img, path).unwrap();
  }

  fn list_sequence(dir: &Path, n: usize) -> ImageSequence {
    let mut paths = Vec::new();
    for i in 0..n {
      let path = dir.join(format!("f{}.bmp", i));
      write_gray_bmp(&path, 8, 6, i as u8);
      paths.push(path);
    }
    ImageSequence::from_image_list(paths).unwrap()
  }

  #[test]
  fn iterates_active_subset() {
    let dir = tempdir().unwrap();
    let mut seq = list_sequence(dir.path(), 5);
    assert_eq!(seq.count(), 5);
    assert_eq!(seq.active_count(), 5);

    seq.set_active_flags(vec![true, false, true, false, true]).unwrap();
    assert_eq!(seq.active_count(), 3);

    seq.seek_start().unwrap();
    assert_eq!(seq.current_index(), 0);
    assert_eq!(seq.current_active_index(), 0);
    seq.seek_next().unwrap();
    assert_eq!(seq.current_index(), 2);
    assert_eq!(seq.current_active_index(), 1);
    seq.seek_next().unwrap();
    assert_eq!(seq.current_index(), 4);
    assert!(matches!(seq.seek_next(), Err(Error::NoMoreImages)));

    let img = seq.current_image().unwrap();
    assert_eq!(img.line(0)[0], 4);
  }

  #[test]
  fn metadata_matches_files() {
    let dir = tempdir().unwrap();
    let mut seq = list_sequence(dir.path(), 2);
    seq.seek_start().unwrap();
    let (w, h, _) = seq.current_metadata().unwrap();
    assert_eq!((w, h), (8, 6));
  }

  #[test]
  fn cfa_override_retags_mono_frames() {
    let dir = tempdir().unwrap();
    let mut seq = list_sequence(dir.path(), 1);
    seq.set_cfa_override(Some(CfaPattern::Bggr));
    let img = seq.image_at(0).unwrap();
    assert_eq!(img.pix_fmt(), PixelFormat::CfaBggr8);
  }

  #[test]
  fn unknown_extension_is_rejected() {
    assert!(ImageSequence::open_video(Path::new("clip.mov")).is_err());
    let r = ImageSequence::from_image_list(vec![PathBuf::from("x.png")]);
    assert!(r.is_ok()); // list creation is lazy...
    let mut seq = r.unwrap();
    assert!(seq.image_at(0).is_err()); // ...decoding dispatch is not
  }
}
