// SER video reading
//
// SER is a fixed-size-frame format: a 178-byte header followed by raw
// frames (and an optional timestamp trailer, which we ignore). Note the
// endianness flag: the format description says 0 means big-endian pixel
// data, but the capture tools in the wild write 0 for little-endian, so
// that is what everybody (including us) follows.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::demosaic::CfaPattern;
use crate::error::{Error, Result};
use crate::image::{cfa_format, Image, PixelFormat};

const SER_HEADER_SIZE: u64 = 178;
const SER_MAGIC: &[u8; 14] = b"LUCAM-RECORDER";

const COLOR_MONO: i32 = 0;
const COLOR_BAYER_RGGB: i32 = 8;
const COLOR_BAYER_GRBG: i32 = 9;
const COLOR_BAYER_GBRG: i32 = 10;
const COLOR_BAYER_BGGR: i32 = 11;
const COLOR_RGB: i32 = 100;
const COLOR_BGR: i32 = 101;

pub struct SerHeader {
  pub color_id: i32,
  pub little_endian: bool,
  pub width: u32,
  pub height: u32,
  pub pixel_depth: u32,
  pub frame_count: u32
}

impl SerHeader {
  fn bytes_per_sample(&self) -> usize {
    if self.pixel_depth <= 8 { 1 } else { 2 }
  }

  fn samples_per_pixel(&self) -> usize {
    match self.color_id {
      COLOR_RGB | COLOR_BGR => 3,
      _ => 1
    }
  }

  fn frame_byte_size(&self) -> usize {
    self.width as usize * self.height as usize
      * self.bytes_per_sample() * self.samples_per_pixel()
  }

  fn pix_fmt(&self) -> PixelFormat {
    let bits = if self.pixel_depth <= 8 { 8 } else { 16 };
    match self.color_id {
      COLOR_BAYER_RGGB => cfa_format(CfaPattern::Rggb, bits),
      COLOR_BAYER_GRBG => cfa_format(CfaPattern::Grbg, bits),
      COLOR_BAYER_GBRG => cfa_format(CfaPattern::Gbrg, bits),
      COLOR_BAYER_BGGR => cfa_format(CfaPattern::Bggr, bits),
      COLOR_RGB | COLOR_BGR => {
        if bits == 8 { PixelFormat::Rgb8 } else { PixelFormat::Rgb16 }
      },
      _ => {
        if bits == 8 { PixelFormat::Mono8 } else { PixelFormat::Mono16 }
      }
    }
  }
}

pub struct SerFile {
  reader: BufReader<File>,
  header: SerHeader
}

impl SerFile {
  pub fn open(path: &Path) -> Result<SerFile> {
    let file = File::open(path)
      .map_err(|_| Error::CannotOpenFile(path.display().to_string()))?;
    let file_len = file.metadata()?.len();
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 14];
    r.read_exact(&mut magic).map_err(|_| Error::SerMalformed("header truncated"))?;
    if &magic != SER_MAGIC {
      return Err(Error::SerMalformed("missing LUCAM-RECORDER signature"));
    }

    let _lu_id = r.read_i32::<LittleEndian>()?;
    let color_id = r.read_i32::<LittleEndian>()?;
    let le_flag = r.read_i32::<LittleEndian>()?;
    let width = r.read_i32::<LittleEndian>()?;
    let height = r.read_i32::<LittleEndian>()?;
    let pixel_depth = r.read_i32::<LittleEndian>()?;
    let frame_count = r.read_i32::<LittleEndian>()?;

    if width <= 0 || height <= 0 {
      return Err(Error::InvalidDimensions);
    }
    if pixel_depth < 1 || pixel_depth > 16 {
      return Err(Error::SerMalformed("bit depth outside 1..16"));
    }
    if frame_count <= 0 {
      return Err(Error::SerMalformed("no frames"));
    }
    match color_id {
      COLOR_MONO | COLOR_BAYER_RGGB | COLOR_BAYER_GRBG | COLOR_BAYER_GBRG
        | COLOR_BAYER_BGGR | COLOR_RGB | COLOR_BGR => {},
      _ => return Err(Error::SerUnsupported("color mode"))
    }

    let header = SerHeader {
      color_id: color_id,
      // 0 de facto means little-endian, contrary to the format description
      little_endian: le_flag != 1,
      width: width as u32,
      height: height as u32,
      pixel_depth: pixel_depth as u32,
      frame_count: frame_count as u32
    };

    let needed = SER_HEADER_SIZE + (header.frame_byte_size() as u64) * frame_count as u64;
    if file_len < needed {
      return Err(Error::SerMalformed("file shorter than its frame data"));
    }

    Ok(SerFile { reader: r, header: header })
  }

  pub fn header(&self) -> &SerHeader {
    &self.header
  }

  pub fn frame_count(&self) -> usize {
    self.header.frame_count as usize
  }

  pub fn metadata(&self) -> (u32, u32, PixelFormat) {
    (self.header.width, self.header.height, self.header.pix_fmt())
  }

  pub fn frame_at(&mut self, index: usize) -> Result<Image> {
    if index >= self.frame_count() {
      return Err(Error::NoMoreImages);
    }
    let frame_size = self.header.frame_byte_size();
    self.reader.seek(SeekFrom::Start(SER_HEADER_SIZE + (index * frame_size) as u64))?;

    let mut raw = vec![0u8; frame_size];
    self.reader.read_exact(&mut raw)
      .map_err(|_| Error::SerMalformed("frame data truncated"))?;

    // 16-bit samples to native byte order
    if self.header.bytes_per_sample() == 2 {
      for pair in raw.chunks_exact_mut(2) {
        let v = if self.header.little_endian {
          u16::from_le_bytes([pair[0], pair[1]])
        } else {
          u16::from_be_bytes([pair[0], pair[1]])
        };
        pair.copy_from_slice(&v.to_ne_bytes());
      }
    }

    // BGR sample order becomes RGB
    if self.header.color_id == COLOR_BGR {
      let sample = self.header.bytes_per_sample();
      for px in raw.chunks_exact_mut(3 * sample) {
        for i in 0..sample {
          px.swap(i, 2 * sample + i);
        }
      }
    }

    Image::from_pixels(self.header.width, self.header.height,
                       self.header.pix_fmt(), None, raw)
  }
}
