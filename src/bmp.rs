// BMP reading and writing
//
// Only the classic 14-byte file header + 40-byte info header layout is
// handled. Rows are stored bottom-up and padded to 4-byte multiples;
// channel order in the file is BGR(A). 8-bit files carry a BGRA palette:
// an identity grayscale palette downgrades the result to Mono8.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::image::{palette_is_grayscale, Image, Palette, PixelFormat};

const BMP_FILE_HEADER_SIZE: u64 = 14;
const BMP_INFO_HEADER_SIZE: u32 = 40;

struct BmpInfo {
  width: u32,
  height: u32,
  top_down: bool,
  bit_count: u16,
  data_offset: u32,
  num_palette_entries: u32
}

fn read_headers<R: Read>(r: &mut R) -> Result<BmpInfo> {
  let mut magic = [0u8; 2];
  r.read_exact(&mut magic)?;
  if &magic != b"BM" {
    return Err(Error::BmpMalformed("missing BM signature"));
  }
  let _file_size = r.read_u32::<LittleEndian>()?;
  let _reserved = r.read_u32::<LittleEndian>()?;
  let data_offset = r.read_u32::<LittleEndian>()?;

  let info_size = r.read_u32::<LittleEndian>()?;
  if info_size < BMP_INFO_HEADER_SIZE {
    return Err(Error::BmpMalformed("info header too short"));
  }
  let width = r.read_i32::<LittleEndian>()?;
  let height = r.read_i32::<LittleEndian>()?;
  let _planes = r.read_u16::<LittleEndian>()?;
  let bit_count = r.read_u16::<LittleEndian>()?;
  let compression = r.read_u32::<LittleEndian>()?;
  let _image_size = r.read_u32::<LittleEndian>()?;
  let _x_ppm = r.read_i32::<LittleEndian>()?;
  let _y_ppm = r.read_i32::<LittleEndian>()?;
  let colors_used = r.read_u32::<LittleEndian>()?;
  let _colors_important = r.read_u32::<LittleEndian>()?;

  if width <= 0 || height == 0 {
    return Err(Error::InvalidDimensions);
  }
  if compression != 0 {
    return Err(Error::BmpUnsupported("compressed BMP"));
  }
  if bit_count != 8 && bit_count != 24 && bit_count != 32 {
    return Err(Error::BmpUnsupported("bit depth other than 8/24/32"));
  }

  let num_palette_entries = if bit_count == 8 {
    if colors_used == 0 { 256 } else { colors_used.min(256) }
  } else {
    0
  };

  Ok(BmpInfo {
    width: width as u32,
    height: height.unsigned_abs(),
    top_down: height < 0,
    bit_count: bit_count,
    data_offset: data_offset,
    num_palette_entries: num_palette_entries
  })
}

fn padded_line_len(width: u32, bit_count: u16) -> usize {
  let raw = width as usize * (bit_count as usize / 8);
  (raw + 3) & !3
}

pub fn load_bmp(path: &Path) -> Result<Image> {
  let file = File::open(path)
    .map_err(|_| Error::CannotOpenFile(path.display().to_string()))?;
  let mut r = BufReader::new(file);
  let info = read_headers(&mut r)?;

  // Palette entries are stored as BGRA
  let mut palette = None;
  if info.bit_count == 8 {
    let mut pal = Palette::new();
    for i in 0..info.num_palette_entries as usize {
      let mut entry = [0u8; 4];
      r.read_exact(&mut entry)?;
      pal.entries[3*i] = entry[2];
      pal.entries[3*i + 1] = entry[1];
      pal.entries[3*i + 2] = entry[0];
    }
    palette = Some(pal);
  }

  r.seek(SeekFrom::Start(info.data_offset as u64))?;

  let (pix_fmt, palette) = match info.bit_count {
    8 => {
      let pal = palette.unwrap();
      if palette_is_grayscale(&pal) {
        (PixelFormat::Mono8, None)
      } else {
        (PixelFormat::Pal8, Some(pal))
      }
    },
    24 => (PixelFormat::Rgb8, None),
    _ => (PixelFormat::Bgra8, None)
  };

  let mut img = Image::new(info.width, info.height, pix_fmt, palette)?;
  let line_len = padded_line_len(info.width, info.bit_count);
  let mut file_line = vec![0u8; line_len];

  for row in 0..info.height {
    r.read_exact(&mut file_line)
      .map_err(|_| Error::BmpMalformed("pixel data truncated"))?;
    let y = if info.top_down { row } else { info.height - 1 - row };
    let dest = img.line_mut(y);
    match info.bit_count {
      8 => dest.copy_from_slice(&file_line[..info.width as usize]),
      24 => {
        // BGR in the file, RGB in memory
        for x in 0..info.width as usize {
          dest[3*x] = file_line[3*x + 2];
          dest[3*x + 1] = file_line[3*x + 1];
          dest[3*x + 2] = file_line[3*x];
        }
      },
      _ => dest.copy_from_slice(&file_line[..4 * info.width as usize])
    }
  }
  return Ok(img);
}

// Read dimensions and pixel format without decoding pixel data
pub fn bmp_metadata(path: &Path) -> Result<(u32, u32, PixelFormat)> {
  let file = File::open(path)
    .map_err(|_| Error::CannotOpenFile(path.display().to_string()))?;
  let mut r = BufReader::new(file);
  let info = read_headers(&mut r)?;
  let fmt = match info.bit_count {
    8 => PixelFormat::Pal8,
    24 => PixelFormat::Rgb8,
    _ => PixelFormat::Bgra8
  };
  Ok((info.width, info.height, fmt))
}

// Write Mono8, Pal8 or Rgb8 as a BMP file
pub fn save_bmp(img: &Image, path: &Path) -> Result<()> {
  let fmt = img.pix_fmt();
  if fmt != PixelFormat::Mono8 && fmt != PixelFormat::Pal8 && fmt != PixelFormat::Rgb8 {
    return Err(Error::UnsupportedPixelFormat(fmt));
  }

  let file = File::create(path)
    .map_err(|_| Error::CannotCreateFile(path.display().to_string()))?;
  let mut w = BufWriter::new(file);

  let bit_count: u16 = if fmt == PixelFormat::Rgb8 { 24 } else { 8 };
  let num_palette_entries: u32 = if bit_count == 8 { 256 } else { 0 };
  let line_len = padded_line_len(img.width(), bit_count);
  let data_offset = BMP_FILE_HEADER_SIZE as u32 + BMP_INFO_HEADER_SIZE + 4 * num_palette_entries;
  let file_size = data_offset + line_len as u32 * img.height();

  w.write_all(b"BM")?;
  w.write_u32::<LittleEndian>(file_size)?;
  w.write_u32::<LittleEndian>(0)?;
  w.write_u32::<LittleEndian>(data_offset)?;

  w.write_u32::<LittleEndian>(BMP_INFO_HEADER_SIZE)?;
  w.write_i32::<LittleEndian>(img.width() as i32)?;
  w.write_i32::<LittleEndian>(img.height() as i32)?;
  w.write_u16::<LittleEndian>(1)?; // planes
  w.write_u16::<LittleEndian>(bit_count)?;
  w.write_u32::<LittleEndian>(0)?; // BI_RGB
  w.write_u32::<LittleEndian>(line_len as u32 * img.height())?;
  w.write_i32::<LittleEndian>(0)?;
  w.write_i32::<LittleEndian>(0)?;
  w.write_u32::<LittleEndian>(num_palette_entries)?;
  w.write_u32::<LittleEndian>(0)?;

  if bit_count == 8 {
    for i in 0..256u32 {
      let (r, g, b) = match img.palette() {
        Some(pal) => pal.rgb(i as u8),
        None => (i as u8, i as u8, i as u8)
      };
      w.write_all(&[b, g, r, 0])?;
    }
  }

  let mut file_line = vec![0u8; line_len];
  for row in 0..img.height() {
    let y = img.height() - 1 - row;
    let src = img.line(y);
    match bit_count {
      8 => file_line[..img.width() as usize].copy_from_slice(src),
      _ => {
        for x in 0..img.width() as usize {
          file_line[3*x] = src[3*x + 2];
          file_line[3*x + 1] = src[3*x + 1];
          file_line[3*x + 2] = src[3*x];
        }
      }
    }
    w.write_all(&file_line)?;
  }
  w.flush()?;
  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn mono8_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gradient.bmp");

    let mut img = Image::new(13, 7, PixelFormat::Mono8, None).unwrap();
    for y in 0..7 {
      for x in 0..13 {
        img.line_mut(y)[x as usize] = (11 * x + 29 * y) as u8;
      }
    }
    save_bmp(&img, &path).unwrap();

    // Written with an identity grayscale palette, so it loads back as Mono8
    let loaded = load_bmp(&path).unwrap();
    assert_eq!(loaded.pix_fmt(), PixelFormat::Mono8);
    assert_eq!(loaded.width(), 13);
    assert_eq!(loaded.height(), 7);
    for y in 0..7 {
      assert_eq!(img.line(y), loaded.line(y));
    }
  }

  #[test]
  fn color_palette_stays_pal8() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pal.bmp");

    let mut pal = Palette::new();
    for i in 0..256usize {
      pal.entries[3*i] = i as u8;
      pal.entries[3*i + 1] = (i / 2) as u8;
      pal.entries[3*i + 2] = 0;
    }
    let mut img = Image::new(4, 4, PixelFormat::Pal8, Some(pal)).unwrap();
    for y in 0..4 {
      img.line_mut(y).copy_from_slice(&[1, 2, 3, 4]);
    }
    save_bmp(&img, &path).unwrap();

    let loaded = load_bmp(&path).unwrap();
    assert_eq!(loaded.pix_fmt(), PixelFormat::Pal8);
    assert_eq!(loaded.palette().unwrap().rgb(3), (3, 1, 0));
    assert_eq!(loaded.line(2), [1, 2, 3, 4]);
  }

  #[test]
  fn rgb8_round_trip_with_padding() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rgb.bmp");

    // Width 3 gives a 9-byte raw line, padded to 12 in the file
    let mut img = Image::new(3, 2, PixelFormat::Rgb8, None).unwrap();
    img.line_mut(0).copy_from_slice(&[255, 0, 0, 0, 255, 0, 0, 0, 255]);
    img.line_mut(1).copy_from_slice(&[10, 20, 30, 40, 50, 60, 70, 80, 90]);
    save_bmp(&img, &path).unwrap();

    let loaded = load_bmp(&path).unwrap();
    assert_eq!(loaded.pix_fmt(), PixelFormat::Rgb8);
    assert_eq!(loaded.line(0), img.line(0));
    assert_eq!(loaded.line(1), img.line(1));
  }

  #[test]
  fn metadata_read_skips_pixels() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meta.bmp");
    let img = Image::new(32, 16, PixelFormat::Mono8, None).unwrap();
    save_bmp(&img, &path).unwrap();

    let (w, h, fmt) = bmp_metadata(&path).unwrap();
    assert_eq!((w, h), (32, 16));
    assert_eq!(fmt, PixelFormat::Pal8); // 8-bit files report Pal8 before palette inspection
  }
}
