// AVI video reading
//
// Minimal RIFF/AVI walk: LIST hdrl (avih + strl/strh/strf + palette),
// junk chunks skipped, LIST movi located, idx1 read for frame positions.
// Only uncompressed video is handled: classic DIB frames (8-bit paletted
// or mono, 24-bit BGR; bottom-up rows padded to 4 bytes) and Y800
// (raw 8-bit grayscale, top-down).
//
// idx1 entries store their offset field either relative to the 'movi'
// list or as an absolute file position, depending on the writing
// application. We probe the first frame and keep whichever
// interpretation lands on a chunk header; this detection is heuristic
// but matches what the files in the wild require.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::image::{palette_is_grayscale, Image, Palette, PixelFormat};

const BI_RGB: u32 = 0;
const BI_Y800: u32 = 0x30303859; // "Y800"

#[derive(Clone, Copy, PartialEq)]
enum FrameLayout {
  Dib,  // bottom-up, 4-byte padded rows
  Y800  // top-down, unpadded
}

pub struct AviFile {
  reader: BufReader<File>,
  width: u32,
  height: u32,
  bit_count: u16,
  layout: FrameLayout,
  palette: Option<Palette>,
  palette_is_gray: bool,
  // Absolute file offset of each frame's chunk header
  frame_positions: Vec<u64>
}

fn read_fourcc<R: Read>(r: &mut R) -> Result<[u8; 4]> {
  let mut fcc = [0u8; 4];
  r.read_exact(&mut fcc)?;
  Ok(fcc)
}

fn skip_bytes<R: Read>(r: &mut R, n: u64) -> Result<()> {
  let mut taken = r.take(n);
  std::io::copy(&mut taken, &mut std::io::sink())?;
  Ok(())
}

fn is_frame_chunk_id(fcc: &[u8; 4]) -> bool {
  // Stream chunks are "NNdb"/"NNdc" with NN the stream number
  fcc[0].is_ascii_digit() && fcc[1].is_ascii_digit()
    && (&fcc[2..4] == b"db" || &fcc[2..4] == b"dc")
}

struct StreamFormat {
  width: u32,
  height: u32,
  bit_count: u16,
  compression: u32,
  palette: Option<Palette>
}

// Parse the strf chunk of the video stream (BITMAPINFOHEADER + palette)
fn parse_strf<R: Read>(r: &mut R, chunk_size: u32) -> Result<StreamFormat> {
  if chunk_size < 40 {
    return Err(Error::AviMalformed("stream format header too short"));
  }
  let _size = r.read_u32::<LittleEndian>()?;
  let width = r.read_i32::<LittleEndian>()?;
  let height = r.read_i32::<LittleEndian>()?;
  let _planes = r.read_u16::<LittleEndian>()?;
  let bit_count = r.read_u16::<LittleEndian>()?;
  let compression = r.read_u32::<LittleEndian>()?;
  let _image_size = r.read_u32::<LittleEndian>()?;
  let _x_ppm = r.read_i32::<LittleEndian>()?;
  let _y_ppm = r.read_i32::<LittleEndian>()?;
  let clr_used = r.read_u32::<LittleEndian>()?;
  let _clr_important = r.read_u32::<LittleEndian>()?;

  if width <= 0 || height == 0 {
    return Err(Error::InvalidDimensions);
  }

  let mut palette = None;
  let mut remaining = chunk_size as i64 - 40;
  if bit_count == 8 {
    let entries = if clr_used == 0 { 256 } else { clr_used.min(256) };
    if remaining >= 4 * entries as i64 {
      let mut pal = Palette::new();
      for i in 0..entries as usize {
        let mut bgra = [0u8; 4];
        r.read_exact(&mut bgra)?;
        pal.entries[3*i] = bgra[2];
        pal.entries[3*i + 1] = bgra[1];
        pal.entries[3*i + 2] = bgra[0];
      }
      remaining -= 4 * entries as i64;
      palette = Some(pal);
    }
  }
  // Trailing format extensions are of no interest
  skip_bytes(r, remaining.max(0) as u64)?;

  Ok(StreamFormat {
    width: width as u32,
    height: height.unsigned_abs(),
    bit_count: bit_count,
    compression: compression,
    palette: palette
  })
}

// Walk the hdrl list and return the first video stream's format
fn parse_hdrl<R: Read>(r: &mut R, list_size: u32) -> Result<StreamFormat> {
  let mut remaining = list_size as i64 - 4; // list type fourcc already consumed
  let mut in_video_stream = false;
  let mut format = None;

  while remaining > 8 {
    let fcc = read_fourcc(r)?;
    let size = r.read_u32::<LittleEndian>()?;
    let padded = (size + (size & 1)) as i64;
    remaining -= 8 + padded;

    match &fcc {
      b"LIST" => {
        let subtype = read_fourcc(r)?;
        // Step into strl lists, skip everything else wholesale
        if &subtype != b"strl" {
          skip_bytes(r, padded as u64 - 4)?;
        } else {
          remaining += padded - 4; // walk the strl contents inline
        }
      },
      b"strh" => {
        let fcc_type = read_fourcc(r)?;
        in_video_stream = &fcc_type == b"vids";
        skip_bytes(r, padded as u64 - 4)?;
      },
      b"strf" if in_video_stream && format.is_none() => {
        format = Some(parse_strf(r, size)?);
        if size & 1 == 1 {
          r.read_u8()?;
        }
      },
      _ => {
        skip_bytes(r, padded as u64)?;
      }
    }
  }

  format.ok_or(Error::AviMalformed("no video stream"))
}

impl AviFile {
  pub fn open(path: &Path) -> Result<AviFile> {
    let file = File::open(path)
      .map_err(|_| Error::CannotOpenFile(path.display().to_string()))?;
    let mut r = BufReader::new(file);

    if &read_fourcc(&mut r)? != b"RIFF" {
      return Err(Error::AviMalformed("missing RIFF signature"));
    }
    let _riff_size = r.read_u32::<LittleEndian>()?;
    if &read_fourcc(&mut r)? != b"AVI " {
      return Err(Error::AviMalformed("not an AVI file"));
    }

    let mut format = None;
    let mut movi_pos = None;
    let mut index_entries: Vec<(u32, u32)> = Vec::new(); // (offset, size)

    loop {
      let fcc = match read_fourcc(&mut r) {
        Ok(fcc) => fcc,
        Err(_) => break // end of file
      };
      let size = match r.read_u32::<LittleEndian>() {
        Ok(size) => size,
        Err(_) => break
      };
      let padded = (size + (size & 1)) as u64;

      match &fcc {
        b"LIST" => {
          let list_pos = r.stream_position()?;
          let subtype = read_fourcc(&mut r)?;
          match &subtype {
            b"hdrl" => format = Some(parse_hdrl(&mut r, size)?),
            b"movi" => movi_pos = Some(list_pos),
            _ => {}
          }
          r.seek(SeekFrom::Start(list_pos + padded))?;
        },
        b"idx1" => {
          let chunk_pos = r.stream_position()?;
          let num_entries = size / 16;
          for _ in 0..num_entries {
            let ckid = read_fourcc(&mut r)?;
            let _flags = r.read_u32::<LittleEndian>()?;
            let offset = r.read_u32::<LittleEndian>()?;
            let entry_size = r.read_u32::<LittleEndian>()?;
            if is_frame_chunk_id(&ckid) {
              index_entries.push((offset, entry_size));
            }
          }
          r.seek(SeekFrom::Start(chunk_pos + padded))?;
        },
        _ => {
          // JUNK and anything else
          let pos = r.stream_position()?;
          r.seek(SeekFrom::Start(pos + padded))?;
        }
      }
    }

    let format = format.ok_or(Error::AviMalformed("missing hdrl list"))?;
    let movi_pos = movi_pos.ok_or(Error::AviMalformed("missing movi list"))?;
    if index_entries.is_empty() {
      return Err(Error::AviMalformed("missing or empty idx1 index"));
    }

    let layout = match (format.compression, format.bit_count) {
      (BI_RGB, 8) | (BI_RGB, 24) => FrameLayout::Dib,
      (BI_Y800, 8) => FrameLayout::Y800,
      _ => return Err(Error::AviUnsupported("only uncompressed DIB and Y800 video"))
    };

    // Offsets in idx1 are relative to the movi list or absolute; probe
    // the first entry and keep the interpretation that hits a chunk header
    let first_offset = index_entries[0].0 as u64;
    let absolute = {
      r.seek(SeekFrom::Start(first_offset))?;
      matches!(read_fourcc(&mut r), Ok(fcc) if is_frame_chunk_id(&fcc))
    };
    if !absolute {
      r.seek(SeekFrom::Start(movi_pos + first_offset))?;
      if !matches!(read_fourcc(&mut r), Ok(fcc) if is_frame_chunk_id(&fcc)) {
        return Err(Error::AviMalformed("index does not point at frame chunks"));
      }
    }

    let frame_positions = index_entries.iter()
      .map(|&(ofs, _)| if absolute { ofs as u64 } else { movi_pos + ofs as u64 })
      .collect();

    let palette_is_gray = match (&format.palette, format.bit_count) {
      (Some(pal), 8) => palette_is_grayscale(pal),
      (None, 8) => true, // no palette: treat indices as gray values
      _ => false
    };

    Ok(AviFile {
      reader: r,
      width: format.width,
      height: format.height,
      bit_count: format.bit_count,
      layout: layout,
      palette: format.palette,
      palette_is_gray: palette_is_gray,
      frame_positions: frame_positions
    })
  }

  pub fn frame_count(&self) -> usize {
    self.frame_positions.len()
  }

  pub fn metadata(&self) -> (u32, u32, PixelFormat) {
    (self.width, self.height, self.stored_pix_fmt())
  }

  fn stored_pix_fmt(&self) -> PixelFormat {
    match (self.layout, self.bit_count) {
      (FrameLayout::Y800, _) => PixelFormat::Mono8,
      (FrameLayout::Dib, 8) => {
        if self.palette_is_gray { PixelFormat::Mono8 } else { PixelFormat::Pal8 }
      },
      _ => PixelFormat::Rgb8
    }
  }

  pub fn frame_at(&mut self, index: usize) -> Result<Image> {
    if index >= self.frame_positions.len() {
      return Err(Error::NoMoreImages);
    }
    self.reader.seek(SeekFrom::Start(self.frame_positions[index]))?;
    let fcc = read_fourcc(&mut self.reader)?;
    if !is_frame_chunk_id(&fcc) {
      return Err(Error::AviMalformed("frame index points outside movi data"));
    }
    let chunk_size = self.reader.read_u32::<LittleEndian>()? as usize;

    let pix_fmt = self.stored_pix_fmt();
    let palette = if pix_fmt == PixelFormat::Pal8 { self.palette.clone() } else { None };
    let mut img = Image::new(self.width, self.height, pix_fmt, palette)?;

    match self.layout {
      FrameLayout::Y800 => {
        let needed = self.width as usize * self.height as usize;
        if chunk_size < needed {
          return Err(Error::AviMalformed("frame chunk too short"));
        }
        for y in 0..self.height {
          self.reader.read_exact(img.line_mut(y))?;
        }
      },
      FrameLayout::Dib => {
        let bytes = self.width as usize * (self.bit_count as usize / 8);
        let line_len = (bytes + 3) & !3;
        if chunk_size < line_len * self.height as usize {
          return Err(Error::AviMalformed("frame chunk too short"));
        }
        let mut file_line = vec![0u8; line_len];
        for row in 0..self.height {
          self.reader.read_exact(&mut file_line)?;
          let dest = img.line_mut(self.height - 1 - row);
          if self.bit_count == 8 {
            dest.copy_from_slice(&file_line[..self.width as usize]);
          } else {
            for x in 0..self.width as usize {
              dest[3*x] = file_line[3*x + 2];
              dest[3*x + 1] = file_line[3*x + 1];
              dest[3*x + 2] = file_line[3*x];
            }
          }
        }
      }
    }
    return Ok(img);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  struct AviBuilder;

  impl AviBuilder {
    fn chunk(out: &mut Vec<u8>, fcc: &[u8; 4], payload: &[u8]) {
      out.extend_from_slice(fcc);
      out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
      out.extend_from_slice(payload);
      if payload.len() & 1 == 1 {
        out.push(0);
      }
    }

    fn list(out: &mut Vec<u8>, subtype: &[u8; 4], payload: &[u8]) {
      out.extend_from_slice(b"LIST");
      out.extend_from_slice(&(4 + payload.len() as u32).to_le_bytes());
      out.extend_from_slice(subtype);
      out.extend_from_slice(payload);
    }

    // Build a gray 8-bit DIB AVI with the given frames
    fn build(width: u32, height: u32, frames: &[Vec<u8>], absolute_index: bool) -> Vec<u8> {
      let mut avih = Vec::new();
      avih.extend_from_slice(&[0u8; 16]);
      avih.extend_from_slice(&(frames.len() as u32).to_le_bytes());
      avih.extend_from_slice(&[0u8; 12]);
      avih.extend_from_slice(&width.to_le_bytes());
      avih.extend_from_slice(&height.to_le_bytes());
      avih.extend_from_slice(&[0u8; 16]);

      let mut strh = Vec::new();
      strh.extend_from_slice(b"vids");
      strh.extend_from_slice(&[0u8; 52]);

      let mut strf = Vec::new();
      strf.extend_from_slice(&40u32.to_le_bytes());
      strf.extend_from_slice(&(width as i32).to_le_bytes());
      strf.extend_from_slice(&(height as i32).to_le_bytes());
      strf.extend_from_slice(&1u16.to_le_bytes());
      strf.extend_from_slice(&8u16.to_le_bytes());
      strf.extend_from_slice(&0u32.to_le_bytes()); // BI_RGB
      strf.extend_from_slice(&[0u8; 20]);
      for i in 0..256u32 {
        strf.extend_from_slice(&[i as u8, i as u8, i as u8, 0]); // gray BGRA
      }

      let mut strl = Vec::new();
      Self::chunk(&mut strl, b"strh", &strh);
      Self::chunk(&mut strl, b"strf", &strf);

      let mut hdrl = Vec::new();
      Self::chunk(&mut hdrl, b"avih", &avih);
      Self::list(&mut hdrl, b"strl", &strl);

      let line_len = (width as usize + 3) & !3;
      let mut movi = Vec::new();
      let mut rel_offsets = Vec::new();
      for frame in frames {
        rel_offsets.push(4 + movi.len() as u32); // counted from the movi fourcc
        let mut dib = Vec::new();
        for row in (0..height).rev() {
          let start = (row * width) as usize;
          dib.extend_from_slice(&frame[start .. start + width as usize]);
          dib.resize(dib.len() + (line_len - width as usize), 0);
        }
        Self::chunk(&mut movi, b"00db", &dib);
      }

      let mut bytes = Vec::new();
      bytes.extend_from_slice(b"RIFF");
      bytes.extend_from_slice(&0u32.to_le_bytes()); // patched below
      bytes.extend_from_slice(b"AVI ");
      Self::list(&mut bytes, b"hdrl", &hdrl);
      Self::chunk(&mut bytes, b"JUNK", &[0u8; 10]);

      let movi_fourcc_pos = bytes.len() as u32 + 8;
      Self::list(&mut bytes, b"movi", &movi);

      let mut idx = Vec::new();
      for (i, rel) in rel_offsets.iter().enumerate() {
        idx.extend_from_slice(b"00db");
        idx.extend_from_slice(&16u32.to_le_bytes()); // AVIIF_KEYFRAME
        let ofs = if absolute_index { movi_fourcc_pos + rel } else { *rel };
        idx.extend_from_slice(&ofs.to_le_bytes());
        idx.extend_from_slice(&(frames[i].len() as u32).to_le_bytes());
      }
      Self::chunk(&mut bytes, b"idx1", &idx);

      let riff_size = bytes.len() as u32 - 8;
      bytes[4..8].copy_from_slice(&riff_size.to_le_bytes());
      return bytes;
    }
  }

  fn frame_data(width: u32, height: u32, seed: u8) -> Vec<u8> {
    (0 .. width * height).map(|i| (i as u8).wrapping_add(seed)).collect()
  }

  #[test]
  fn gray_dib_frames_with_relative_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rel.avi");
    let frames = vec![frame_data(6, 4, 0), frame_data(6, 4, 100)];
    std::fs::write(&path, AviBuilder::build(6, 4, &frames, false)).unwrap();

    let mut avi = AviFile::open(&path).unwrap();
    assert_eq!(avi.frame_count(), 2);
    assert_eq!(avi.metadata(), (6, 4, PixelFormat::Mono8));

    let img = avi.frame_at(1).unwrap();
    for y in 0..4u32 {
      let expected: Vec<u8> = (0..6).map(|x| ((y * 6 + x) as u8).wrapping_add(100)).collect();
      assert_eq!(img.line(y), &expected[..]);
    }
  }

  #[test]
  fn gray_dib_frames_with_absolute_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("abs.avi");
    let frames = vec![frame_data(5, 3, 7)];
    std::fs::write(&path, AviBuilder::build(5, 3, &frames, true)).unwrap();

    let mut avi = AviFile::open(&path).unwrap();
    let img = avi.frame_at(0).unwrap();
    assert_eq!(img.pix_fmt(), PixelFormat::Mono8);
    assert_eq!(img.line(0), [7, 8, 9, 10, 11]);
  }

  #[test]
  fn truncated_riff_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.avi");
    std::fs::write(&path, b"RIFF\x04\x00\x00\x00AVI ").unwrap();
    assert!(matches!(AviFile::open(&path), Err(Error::AviMalformed(_))));
  }
}
