// Baseline TIFF reading and writing
//
// Classic (non-Big) TIFF only: II/MM byte-order marker, version 42,
// first IFD. Strip-based, uncompressed, chunky planar configuration,
// {1, 3} samples x {8, 16} bits. WhiteIsZero mono data is inverted on
// read. The writer emits little-endian, single-strip files.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::image::{Image, PixelFormat, SampleType};

const TIFF_VERSION: u16 = 42;

const TAG_IMAGE_WIDTH: u16 = 0x100;
const TAG_IMAGE_LENGTH: u16 = 0x101;
const TAG_BITS_PER_SAMPLE: u16 = 0x102;
const TAG_COMPRESSION: u16 = 0x103;
const TAG_PHOTOMETRIC: u16 = 0x106;
const TAG_STRIP_OFFSETS: u16 = 0x111;
const TAG_SAMPLES_PER_PIXEL: u16 = 0x115;
const TAG_ROWS_PER_STRIP: u16 = 0x116;
const TAG_STRIP_BYTE_COUNTS: u16 = 0x117;
const TAG_PLANAR_CONFIG: u16 = 0x11C;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

const PHOTOMETRIC_WHITE_IS_ZERO: u32 = 0;
const PHOTOMETRIC_BLACK_IS_ZERO: u32 = 1;
const PHOTOMETRIC_RGB: u32 = 2;

#[derive(Clone, Copy, PartialEq)]
enum Endian {
  Little,
  Big
}

impl Endian {
  fn u16(self, bytes: &[u8]) -> u16 {
    match self {
      Endian::Little => LittleEndian::read_u16(bytes),
      Endian::Big => BigEndian::read_u16(bytes)
    }
  }

  fn u32(self, bytes: &[u8]) -> u32 {
    match self {
      Endian::Little => LittleEndian::read_u32(bytes),
      Endian::Big => BigEndian::read_u32(bytes)
    }
  }
}

struct IfdEntry {
  tag: u16,
  field_type: u16,
  count: u32,
  raw_value: [u8; 4]
}

impl IfdEntry {
  // Scalar value of an inline SHORT/LONG field
  fn scalar(&self, endian: Endian) -> Result<u32> {
    match self.field_type {
      TYPE_SHORT => Ok(self.endian_first_u16(endian) as u32),
      TYPE_LONG => Ok(endian.u32(&self.raw_value)),
      _ => Err(Error::TiffIncompleteField)
    }
  }

  fn endian_first_u16(&self, endian: Endian) -> u16 {
    // Inline values are left-justified within the 4-byte field
    endian.u16(&self.raw_value[0..2])
  }
}

struct TiffHeader {
  endian: Endian,
  width: u32,
  height: u32,
  bits_per_sample: u32,
  samples_per_pixel: u32,
  photometric: u32,
  strip_offsets: Vec<u32>,
  strip_byte_counts: Vec<u32>
}

impl TiffHeader {
  fn pix_fmt(&self) -> PixelFormat {
    match (self.samples_per_pixel, self.bits_per_sample) {
      (1, 8) => PixelFormat::Mono8,
      (1, _) => PixelFormat::Mono16,
      (_, 8) => PixelFormat::Rgb8,
      _ => PixelFormat::Rgb16
    }
  }
}

// Read all values of a possibly out-of-line SHORT/LONG field
fn read_values<R: Read + Seek>(r: &mut R, entry: &IfdEntry, endian: Endian) -> Result<Vec<u32>> {
  let elem_size = match entry.field_type {
    TYPE_SHORT => 2usize,
    TYPE_LONG => 4usize,
    _ => return Err(Error::TiffIncompleteField)
  };
  let total = elem_size * entry.count as usize;

  let mut bytes = vec![0u8; total];
  if total <= 4 {
    bytes.copy_from_slice(&entry.raw_value[..total]);
  } else {
    let offset = endian.u32(&entry.raw_value);
    let saved = r.stream_position()?;
    r.seek(SeekFrom::Start(offset as u64))?;
    r.read_exact(&mut bytes).map_err(|_| Error::TiffIncompleteField)?;
    r.seek(SeekFrom::Start(saved))?;
  }

  let mut values = Vec::with_capacity(entry.count as usize);
  for i in 0..entry.count as usize {
    values.push(match entry.field_type {
      TYPE_SHORT => endian.u16(&bytes[2*i .. 2*i + 2]) as u32,
      _ => endian.u32(&bytes[4*i .. 4*i + 4])
    });
  }
  return Ok(values);
}

fn parse_header<R: Read + Seek>(r: &mut R) -> Result<TiffHeader> {
  let mut order = [0u8; 2];
  r.read_exact(&mut order).map_err(|_| Error::TiffIncompleteHeader)?;
  let endian = match &order {
    b"II" => Endian::Little,
    b"MM" => Endian::Big,
    _ => return Err(Error::TiffIncompleteHeader)
  };

  let mut buf4 = [0u8; 4];
  r.read_exact(&mut buf4[..2]).map_err(|_| Error::TiffIncompleteHeader)?;
  if endian.u16(&buf4[..2]) != TIFF_VERSION {
    return Err(Error::TiffUnknownVersion);
  }
  r.read_exact(&mut buf4).map_err(|_| Error::TiffIncompleteHeader)?;
  let ifd_offset = endian.u32(&buf4);

  r.seek(SeekFrom::Start(ifd_offset as u64))?;
  let mut buf2 = [0u8; 2];
  r.read_exact(&mut buf2).map_err(|_| Error::TiffIncompleteHeader)?;
  let num_entries = endian.u16(&buf2);

  let mut entries = Vec::with_capacity(num_entries as usize);
  for _ in 0..num_entries {
    let mut raw = [0u8; 12];
    r.read_exact(&mut raw).map_err(|_| Error::TiffIncompleteField)?;
    entries.push(IfdEntry {
      tag: endian.u16(&raw[0..2]),
      field_type: endian.u16(&raw[2..4]),
      count: endian.u32(&raw[4..8]),
      raw_value: raw[8..12].try_into().unwrap()
    });
  }

  let mut width = 0u32;
  let mut height = 0u32;
  let mut bits: Vec<u32> = vec![8];
  let mut samples = 1u32;
  let mut photometric = PHOTOMETRIC_BLACK_IS_ZERO;
  let mut strip_offsets = Vec::new();
  let mut strip_byte_counts = Vec::new();

  for entry in &entries {
    match entry.tag {
      TAG_IMAGE_WIDTH => width = entry.scalar(endian)?,
      TAG_IMAGE_LENGTH => height = entry.scalar(endian)?,
      TAG_BITS_PER_SAMPLE => bits = read_values(r, entry, endian)?,
      TAG_COMPRESSION => {
        if entry.scalar(endian)? != 1 {
          return Err(Error::TiffCompressed);
        }
      },
      TAG_PHOTOMETRIC => photometric = entry.scalar(endian)?,
      TAG_STRIP_OFFSETS => strip_offsets = read_values(r, entry, endian)?,
      TAG_SAMPLES_PER_PIXEL => samples = entry.scalar(endian)?,
      TAG_ROWS_PER_STRIP => { let _ = entry.scalar(endian)?; },
      TAG_STRIP_BYTE_COUNTS => strip_byte_counts = read_values(r, entry, endian)?,
      TAG_PLANAR_CONFIG => {
        if entry.scalar(endian)? != 1 {
          return Err(Error::TiffUnsupportedPlanarConfig);
        }
      },
      _ => {} // tags irrelevant to decoding are skipped
    }
  }

  if width == 0 || height == 0 {
    return Err(Error::InvalidDimensions);
  }
  if bits.is_empty() || bits.iter().any(|&b| b != bits[0]) {
    return Err(Error::TiffDiffChannelBitDepths);
  }
  if bits[0] != 8 && bits[0] != 16 {
    return Err(Error::UnsupportedFileFormat("TIFF bit depth other than 8/16".into()));
  }
  if samples != 1 && samples != 3 {
    return Err(Error::UnsupportedFileFormat("TIFF sample count other than 1/3".into()));
  }
  match photometric {
    PHOTOMETRIC_WHITE_IS_ZERO | PHOTOMETRIC_BLACK_IS_ZERO | PHOTOMETRIC_RGB => {},
    _ => return Err(Error::UnsupportedFileFormat("TIFF photometric interpretation".into()))
  }
  if strip_offsets.is_empty() || strip_offsets.len() != strip_byte_counts.len() {
    return Err(Error::TiffIncompleteField);
  }

  Ok(TiffHeader {
    endian: endian,
    width: width,
    height: height,
    bits_per_sample: bits[0],
    samples_per_pixel: samples,
    photometric: photometric,
    strip_offsets: strip_offsets,
    strip_byte_counts: strip_byte_counts
  })
}

pub fn load_tiff(path: &Path) -> Result<Image> {
  let file = File::open(path)
    .map_err(|_| Error::CannotOpenFile(path.display().to_string()))?;
  let mut r = BufReader::new(file);
  let hdr = parse_header(&mut r)?;

  let bytes_per_sample = (hdr.bits_per_sample / 8) as usize;
  let expected = hdr.width as usize * hdr.height as usize
               * hdr.samples_per_pixel as usize * bytes_per_sample;

  let mut data = Vec::with_capacity(expected);
  for (&offset, &count) in hdr.strip_offsets.iter().zip(hdr.strip_byte_counts.iter()) {
    r.seek(SeekFrom::Start(offset as u64))?;
    let mut strip = vec![0u8; count as usize];
    r.read_exact(&mut strip).map_err(|_| Error::TiffIncompletePixelData)?;
    data.extend_from_slice(&strip);
  }
  if data.len() < expected {
    return Err(Error::TiffIncompletePixelData);
  }
  data.truncate(expected);

  // 16-bit samples to native byte order
  if bytes_per_sample == 2 {
    for pair in data.chunks_exact_mut(2) {
      let v = hdr.endian.u16(pair);
      pair.copy_from_slice(&v.to_ne_bytes());
    }
  }

  // WhiteIsZero stores an inverted brightness scale
  if hdr.photometric == PHOTOMETRIC_WHITE_IS_ZERO {
    if bytes_per_sample == 1 {
      for v in data.iter_mut() {
        *v = 255 - *v;
      }
    } else {
      for pair in data.chunks_exact_mut(2) {
        let v = 65535 - u16::from_ne_bytes([pair[0], pair[1]]);
        pair.copy_from_slice(&v.to_ne_bytes());
      }
    }
  }

  Image::from_pixels(hdr.width, hdr.height, hdr.pix_fmt(), None, data)
}

pub fn tiff_metadata(path: &Path) -> Result<(u32, u32, PixelFormat)> {
  let file = File::open(path)
    .map_err(|_| Error::CannotOpenFile(path.display().to_string()))?;
  let mut r = BufReader::new(file);
  let hdr = parse_header(&mut r)?;
  Ok((hdr.width, hdr.height, hdr.pix_fmt()))
}

// Write a single-strip uncompressed little-endian TIFF;
// Mono8/Mono16/Rgb8/Rgb16 are accepted
pub fn save_tiff(img: &Image, path: &Path) -> Result<()> {
  let (samples, photometric) = match img.pix_fmt() {
    PixelFormat::Mono8 | PixelFormat::Mono16 => (1u16, PHOTOMETRIC_BLACK_IS_ZERO),
    PixelFormat::Rgb8 | PixelFormat::Rgb16 => (3u16, PHOTOMETRIC_RGB),
    fmt => return Err(Error::UnsupportedPixelFormat(fmt))
  };
  let bits = img.pix_fmt().bits_per_channel() as u16;

  let file = File::create(path)
    .map_err(|_| Error::CannotCreateFile(path.display().to_string()))?;
  let mut w = BufWriter::new(file);

  let data_len = img.pixels().len();
  let padded_data_len = (data_len + 1) & !1;
  let bits_array_offset = 8 + padded_data_len as u32;
  let bits_array_len = if samples == 3 { 6u32 } else { 0 };
  let ifd_offset = bits_array_offset + bits_array_len;

  w.write_all(b"II")?;
  w.write_u16::<LittleEndian>(TIFF_VERSION)?;
  w.write_u32::<LittleEndian>(ifd_offset)?;

  // Pixel data as one strip, starting right after the 8-byte header
  if img.pix_fmt().sample_type() == SampleType::U16 {
    for pair in img.pixels().chunks_exact(2) {
      w.write_u16::<LittleEndian>(u16::from_ne_bytes([pair[0], pair[1]]))?;
    }
  } else {
    w.write_all(img.pixels())?;
  }
  if padded_data_len != data_len {
    w.write_u8(0)?;
  }

  if samples == 3 {
    for _ in 0..3 {
      w.write_u16::<LittleEndian>(bits)?;
    }
  }

  let write_entry = |w: &mut BufWriter<File>, tag: u16, field_type: u16,
                     count: u32, value: u32| -> Result<()> {
    w.write_u16::<LittleEndian>(tag)?;
    w.write_u16::<LittleEndian>(field_type)?;
    w.write_u32::<LittleEndian>(count)?;
    if field_type == TYPE_SHORT && count == 1 {
      w.write_u16::<LittleEndian>(value as u16)?;
      w.write_u16::<LittleEndian>(0)?;
    } else {
      w.write_u32::<LittleEndian>(value)?;
    }
    Ok(())
  };

  w.write_u16::<LittleEndian>(9)?; // entry count
  write_entry(&mut w, TAG_IMAGE_WIDTH, TYPE_LONG, 1, img.width())?;
  write_entry(&mut w, TAG_IMAGE_LENGTH, TYPE_LONG, 1, img.height())?;
  if samples == 3 {
    write_entry(&mut w, TAG_BITS_PER_SAMPLE, TYPE_SHORT, 3, bits_array_offset)?;
  } else {
    write_entry(&mut w, TAG_BITS_PER_SAMPLE, TYPE_SHORT, 1, bits as u32)?;
  }
  write_entry(&mut w, TAG_COMPRESSION, TYPE_SHORT, 1, 1)?;
  write_entry(&mut w, TAG_PHOTOMETRIC, TYPE_SHORT, 1, photometric)?;
  write_entry(&mut w, TAG_STRIP_OFFSETS, TYPE_LONG, 1, 8)?;
  write_entry(&mut w, TAG_SAMPLES_PER_PIXEL, TYPE_SHORT, 1, samples as u32)?;
  write_entry(&mut w, TAG_ROWS_PER_STRIP, TYPE_LONG, 1, img.height())?;
  write_entry(&mut w, TAG_STRIP_BYTE_COUNTS, TYPE_LONG, 1, data_len as u32)?;
  w.write_u32::<LittleEndian>(0)?; // no further IFDs

  w.flush()?;
  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn mono16_round_trip_is_byte_exact() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("m16.tiff");

    let mut img = Image::new(128, 128, PixelFormat::Mono16, None).unwrap();
    for y in 0..128u32 {
      let line = img.line_mut(y);
      for x in 0..128usize {
        let v = (x as u16).wrapping_mul(517) ^ (y as u16).wrapping_mul(311);
        line[2*x .. 2*x + 2].copy_from_slice(&v.to_ne_bytes());
      }
    }
    save_tiff(&img, &path).unwrap();

    let loaded = load_tiff(&path).unwrap();
    assert_eq!(loaded.pix_fmt(), PixelFormat::Mono16);
    assert_eq!(loaded.pixels(), img.pixels());

    // Save the reloaded image again: still identical
    let path2 = dir.path().join("m16b.tiff");
    save_tiff(&loaded, &path2).unwrap();
    let again = load_tiff(&path2).unwrap();
    assert_eq!(again.pixels(), img.pixels());
  }

  #[test]
  fn rgb8_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rgb.tiff");

    let mut img = Image::new(5, 3, PixelFormat::Rgb8, None).unwrap();
    for y in 0..3u32 {
      for i in 0..15usize {
        img.line_mut(y)[i] = (y as usize * 40 + i) as u8;
      }
    }
    save_tiff(&img, &path).unwrap();

    let loaded = load_tiff(&path).unwrap();
    assert_eq!(loaded.pix_fmt(), PixelFormat::Rgb8);
    assert_eq!(loaded.pixels(), img.pixels());
  }

  // Hand-assembled single-strip gray file: big-endian with WhiteIsZero
  fn write_mm_white_is_zero(path: &Path) {
    let mut bytes: Vec<u8> = Vec::new();
    bytes.extend_from_slice(b"MM");
    bytes.extend_from_slice(&42u16.to_be_bytes());
    bytes.extend_from_slice(&12u32.to_be_bytes()); // IFD offset

    bytes.extend_from_slice(&[250, 245, 240, 235]); // 4 pixels, 2x2

    let entry = |bytes: &mut Vec<u8>, tag: u16, field_type: u16, count: u32, value: u32| {
      bytes.extend_from_slice(&tag.to_be_bytes());
      bytes.extend_from_slice(&field_type.to_be_bytes());
      bytes.extend_from_slice(&count.to_be_bytes());
      if field_type == TYPE_SHORT {
        bytes.extend_from_slice(&(value as u16).to_be_bytes());
        bytes.extend_from_slice(&[0, 0]);
      } else {
        bytes.extend_from_slice(&value.to_be_bytes());
      }
    };

    bytes.extend_from_slice(&8u16.to_be_bytes());
    entry(&mut bytes, TAG_IMAGE_WIDTH, TYPE_LONG, 1, 2);
    entry(&mut bytes, TAG_IMAGE_LENGTH, TYPE_LONG, 1, 2);
    entry(&mut bytes, TAG_BITS_PER_SAMPLE, TYPE_SHORT, 1, 8);
    entry(&mut bytes, TAG_COMPRESSION, TYPE_SHORT, 1, 1);
    entry(&mut bytes, TAG_PHOTOMETRIC, TYPE_SHORT, 1, 0); // WhiteIsZero
    entry(&mut bytes, TAG_STRIP_OFFSETS, TYPE_LONG, 1, 8);
    entry(&mut bytes, TAG_SAMPLES_PER_PIXEL, TYPE_SHORT, 1, 1);
    entry(&mut bytes, TAG_STRIP_BYTE_COUNTS, TYPE_LONG, 1, 4);
    bytes.extend_from_slice(&0u32.to_be_bytes());

    std::fs::write(path, bytes).unwrap();
  }

  #[test]
  fn big_endian_white_is_zero_is_inverted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wiz.tiff");
    write_mm_white_is_zero(&path);

    let img = load_tiff(&path).unwrap();
    assert_eq!(img.pix_fmt(), PixelFormat::Mono8);
    assert_eq!(img.line(0), [5, 10]);
    assert_eq!(img.line(1), [15, 20]);
  }

  #[test]
  fn version_and_compression_are_checked() {
    let dir = tempdir().unwrap();

    let bad_version = dir.path().join("bad.tiff");
    std::fs::write(&bad_version, b"II\x2B\x00\x08\x00\x00\x00").unwrap();
    assert!(matches!(load_tiff(&bad_version), Err(Error::TiffUnknownVersion)));

    let truncated = dir.path().join("trunc.tiff");
    std::fs::write(&truncated, b"II").unwrap();
    assert!(matches!(load_tiff(&truncated), Err(Error::TiffIncompleteHeader)));
  }
}
