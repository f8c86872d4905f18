// Image representation and pixel-format conversion
//
// An Image owns a contiguous pixel buffer with no row padding:
// stride = width * bytes_per_pixel(format). Rows are stored top to bottom.
// Multi-byte samples are kept in native byte order; file readers are
// responsible for byte-swapping on load.

use bytemuck::allocation::zeroed_slice_box;

use crate::demosaic::{self, CfaPattern, DemosaicMethod};
use crate::error::{Error, Result};
use crate::geom::Rect;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
  Invalid,
  Pal8,
  Mono8,
  Rgb8,
  Bgra8,
  Mono16,
  Rgb16,
  Rgba16,
  Mono32f,
  Rgb32f,
  Mono64f,
  Rgb64f,
  CfaRggb8,
  CfaGrbg8,
  CfaGbrg8,
  CfaBggr8,
  CfaRggb16,
  CfaGrbg16,
  CfaGbrg16,
  CfaBggr16
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleType {
  U8,
  U16,
  F32,
  F64
}

impl PixelFormat {
  pub fn bytes_per_pixel(self) -> usize {
    use PixelFormat::*;
    match self {
      Invalid => 0,
      Pal8 | Mono8 | CfaRggb8 | CfaGrbg8 | CfaGbrg8 | CfaBggr8 => 1,
      Mono16 | CfaRggb16 | CfaGrbg16 | CfaGbrg16 | CfaBggr16 => 2,
      Rgb8 => 3,
      Bgra8 | Mono32f => 4,
      Rgb16 => 6,
      Rgba16 | Mono64f => 8,
      Rgb32f => 12,
      Rgb64f => 24
    }
  }

  pub fn num_channels(self) -> usize {
    use PixelFormat::*;
    match self {
      Invalid => 0,
      Pal8 | Mono8 | Mono16 | Mono32f | Mono64f
        | CfaRggb8 | CfaGrbg8 | CfaGbrg8 | CfaBggr8
        | CfaRggb16 | CfaGrbg16 | CfaGbrg16 | CfaBggr16 => 1,
      Rgb8 | Rgb16 | Rgb32f | Rgb64f => 3,
      Bgra8 | Rgba16 => 4
    }
  }

  pub fn bits_per_channel(self) -> usize {
    use PixelFormat::*;
    match self {
      Invalid => 0,
      Pal8 | Mono8 | Rgb8 | Bgra8
        | CfaRggb8 | CfaGrbg8 | CfaGbrg8 | CfaBggr8 => 8,
      Mono16 | Rgb16 | Rgba16
        | CfaRggb16 | CfaGrbg16 | CfaGbrg16 | CfaBggr16 => 16,
      Mono32f | Rgb32f => 32,
      Mono64f | Rgb64f => 64
    }
  }

  pub fn is_cfa(self) -> bool {
    self.cfa_pattern().is_some()
  }

  pub fn cfa_pattern(self) -> Option<CfaPattern> {
    use PixelFormat::*;
    match self {
      CfaRggb8 | CfaRggb16 => Some(CfaPattern::Rggb),
      CfaGrbg8 | CfaGrbg16 => Some(CfaPattern::Grbg),
      CfaGbrg8 | CfaGbrg16 => Some(CfaPattern::Gbrg),
      CfaBggr8 | CfaBggr16 => Some(CfaPattern::Bggr),
      _ => None
    }
  }

  pub fn sample_type(self) -> SampleType {
    match self.bits_per_channel() {
      8 => SampleType::U8,
      16 => SampleType::U16,
      32 => SampleType::F32,
      _ => SampleType::F64
    }
  }
}

// Build the CFA format tag for a pattern at a given bit depth (8 or 16)
pub fn cfa_format(pattern: CfaPattern, bits_per_channel: usize) -> PixelFormat {
  use PixelFormat::*;
  match (pattern, bits_per_channel) {
    (CfaPattern::Rggb, 8) => CfaRggb8,
    (CfaPattern::Grbg, 8) => CfaGrbg8,
    (CfaPattern::Gbrg, 8) => CfaGbrg8,
    (CfaPattern::Bggr, 8) => CfaBggr8,
    (CfaPattern::Rggb, 16) => CfaRggb16,
    (CfaPattern::Grbg, 16) => CfaGrbg16,
    (CfaPattern::Gbrg, 16) => CfaGbrg16,
    (CfaPattern::Bggr, 16) => CfaBggr16,
    _ => panic!("CFA formats exist only at 8 and 16 bits")
  }
}

// 256-entry RGB palette, only present for Pal8 images
#[derive(Clone)]
pub struct Palette {
  pub entries: [u8; 3 * 256]
}

impl Palette {
  pub fn new() -> Self {
    Palette { entries: [0; 3 * 256] }
  }

  pub fn rgb(&self, index: u8) -> (u8, u8, u8) {
    let i = 3 * index as usize;
    (self.entries[i], self.entries[i + 1], self.entries[i + 2])
  }
}

// An identity grayscale palette maps every index onto the gray level of
// the same value, so the indices themselves are already Mono8 pixels
pub fn palette_is_grayscale(pal: &Palette) -> bool {
  for i in 0..256 {
    let (r, g, b) = pal.rgb(i as u8);
    if r != i as u8 || g != i as u8 || b != i as u8 {
      return false;
    }
  }
  return true;
}

pub struct Image {
  width: u32,
  height: u32,
  pix_fmt: PixelFormat,
  palette: Option<Box<Palette>>,
  data: Box<[u8]>
}

impl Clone for Image {
  fn clone(&self) -> Self {
    Image {
      width: self.width,
      height: self.height,
      pix_fmt: self.pix_fmt,
      palette: self.palette.clone(),
      data: self.data.clone()
    }
  }
}

impl Image {
  pub fn new(width: u32, height: u32, pix_fmt: PixelFormat,
             palette: Option<Palette>) -> Result<Image> {
    if width == 0 || height == 0 {
      return Err(Error::InvalidDimensions);
    }
    if pix_fmt == PixelFormat::Invalid {
      return Err(Error::UnsupportedPixelFormat(pix_fmt));
    }

    let num_bytes = width as usize * height as usize * pix_fmt.bytes_per_pixel();
    Ok(Image {
      width: width,
      height: height,
      pix_fmt: pix_fmt,
      palette: palette.map(Box::new),
      data: zeroed_slice_box(num_bytes)
    })
  }

  // Take ownership of an existing pixel buffer; its length must match
  pub fn from_pixels(width: u32, height: u32, pix_fmt: PixelFormat,
                     palette: Option<Palette>, data: Vec<u8>) -> Result<Image> {
    if width == 0 || height == 0 {
      return Err(Error::InvalidDimensions);
    }
    let expected = width as usize * height as usize * pix_fmt.bytes_per_pixel();
    if data.len() != expected {
      return Err(Error::InvalidParameters("pixel buffer length does not match dimensions"));
    }
    Ok(Image {
      width: width,
      height: height,
      pix_fmt: pix_fmt,
      palette: palette.map(Box::new),
      data: data.into_boxed_slice()
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn pix_fmt(&self) -> PixelFormat {
    self.pix_fmt
  }

  pub fn rect(&self) -> Rect {
    Rect::new(0, 0, self.width, self.height)
  }

  pub fn palette(&self) -> Option<&Palette> {
    self.palette.as_deref()
  }

  pub fn bytes_per_line(&self) -> usize {
    self.width as usize * self.pix_fmt.bytes_per_pixel()
  }

  pub fn line(&self, y: u32) -> &[u8] {
    let stride = self.bytes_per_line();
    let start = y as usize * stride;
    &self.data[start .. start + stride]
  }

  pub fn line_mut(&mut self, y: u32) -> &mut [u8] {
    let stride = self.bytes_per_line();
    let start = y as usize * stride;
    &mut self.data[start .. start + stride]
  }

  pub fn pixels(&self) -> &[u8] {
    &self.data
  }

  pub fn pixels_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  // Mono8 accessor used by the block matcher and quality metric
  pub fn value8(&self, x: u32, y: u32) -> u8 {
    debug_assert!(self.pix_fmt.bytes_per_pixel() == 1);
    self.data[y as usize * self.width as usize + x as usize]
  }

  // Single-channel read of a float image (Mono32f or Rgb32f)
  pub fn value_f32(&self, x: u32, y: u32, channel: usize) -> f32 {
    let ch = self.pix_fmt.num_channels();
    debug_assert!(self.pix_fmt.sample_type() == SampleType::F32 && channel < ch);
    let ofs = (y as usize * self.width as usize + x as usize) * ch * 4 + channel * 4;
    f32::from_ne_bytes(self.data[ofs .. ofs + 4].try_into().unwrap())
  }

  pub fn set_value_f32(&mut self, x: u32, y: u32, channel: usize, value: f32) {
    let ch = self.pix_fmt.num_channels();
    debug_assert!(self.pix_fmt.sample_type() == SampleType::F32 && channel < ch);
    let ofs = (y as usize * self.width as usize + x as usize) * ch * 4 + channel * 4;
    self.data[ofs .. ofs + 4].copy_from_slice(&value.to_ne_bytes());
  }

  // Change only the format tag, reinterpreting raw mono data as a Bayer
  // mosaic (or re-tagging an existing mosaic with a different pattern)
  pub fn reinterpret_as_cfa(&mut self, pattern: CfaPattern) -> Result<()> {
    let bits = self.pix_fmt.bits_per_channel();
    match self.pix_fmt {
      PixelFormat::Mono8 | PixelFormat::Mono16 => {
        self.pix_fmt = cfa_format(pattern, bits);
        Ok(())
      },
      fmt if fmt.is_cfa() => {
        self.pix_fmt = cfa_format(pattern, bits);
        Ok(())
      },
      fmt => Err(Error::UnsupportedPixelFormat(fmt))
    }
  }

  pub fn convert_pix_fmt(&self, dest_fmt: PixelFormat,
                         demosaic_method: DemosaicMethod) -> Result<Image> {
    self.convert_pix_fmt_of_subimage(dest_fmt, 0, 0, self.width, self.height, demosaic_method)
  }

  // Convert a sub-rectangle of this image to `dest_fmt`. The rectangle must
  // lie fully within the image. The destination may be any non-CFA,
  // non-paletted format.
  pub fn convert_pix_fmt_of_subimage(&self, dest_fmt: PixelFormat,
                                     x0: i32, y0: i32, width: u32, height: u32,
                                     demosaic_method: DemosaicMethod) -> Result<Image> {
    if self.pix_fmt == PixelFormat::Invalid {
      return Err(Error::UnsupportedPixelFormat(self.pix_fmt));
    }
    if dest_fmt == PixelFormat::Invalid || dest_fmt == PixelFormat::Pal8 || dest_fmt.is_cfa() {
      return Err(Error::UnsupportedPixelFormat(dest_fmt));
    }
    if x0 < 0 || y0 < 0 || width == 0 || height == 0
       || x0 as i64 + width as i64 > self.width as i64
       || y0 as i64 + height as i64 > self.height as i64 {
      return Err(Error::InvalidParameters("conversion rectangle outside the image"));
    }

    // Same format: plain per-line copy
    if self.pix_fmt == dest_fmt {
      let mut out = Image::new(width, height, dest_fmt, self.palette().cloned())?;
      let bpp = self.pix_fmt.bytes_per_pixel();
      for y in 0..height {
        let src = &self.line(y0 as u32 + y)[x0 as usize * bpp .. (x0 as usize + width as usize) * bpp];
        out.line_mut(y).copy_from_slice(src);
      }
      return Ok(out);
    }

    if self.pix_fmt.is_cfa() {
      return self.convert_cfa_subimage(dest_fmt, x0, y0, width, height, demosaic_method);
    }

    let mut out = Image::new(width, height, dest_fmt, None)?;
    let dst_type = dest_fmt.sample_type();
    let dst_mono = dest_fmt.num_channels() == 1;

    for y in 0..height {
      let src_line = self.line(y0 as u32 + y);
      let dst_line = out.line_mut(y);
      for x in 0..width {
        let rgb = read_pixel_rgb(src_line, x0 as usize + x as usize,
                                 self.pix_fmt, self.palette.as_deref());
        if dst_mono {
          let m = convert_sample(mean3(rgb), dst_type);
          write_pixel(dst_line, x as usize, dest_fmt, [m, m, m]);
        } else {
          let c = [convert_sample(rgb[0], dst_type),
                   convert_sample(rgb[1], dst_type),
                   convert_sample(rgb[2], dst_type)];
          write_pixel(dst_line, x as usize, dest_fmt, c);
        }
      }
    }
    return Ok(out);
  }

  fn convert_cfa_subimage(&self, dest_fmt: PixelFormat,
                          x0: i32, y0: i32, width: u32, height: u32,
                          demosaic_method: DemosaicMethod) -> Result<Image> {
    let base = self.pix_fmt.cfa_pattern().unwrap();
    let bits = self.pix_fmt.bits_per_channel();

    // Cut out the raw mosaic sub-rectangle. An odd offset shifts the 2x2
    // grid, so the pattern tag is rotated accordingly and the demosaicer
    // always sees its canonical variant.
    let pattern = demosaic::translate_pattern(base, (x0 & 1) as usize, (y0 & 1) as usize);
    let bpp = self.pix_fmt.bytes_per_pixel();
    let mut raw = Image::new(width, height, cfa_format(pattern, bits), None)?;
    for y in 0..height {
      let src = &self.line(y0 as u32 + y)[x0 as usize * bpp .. (x0 as usize + width as usize) * bpp];
      raw.line_mut(y).copy_from_slice(src);
    }

    if dest_fmt == PixelFormat::Mono8 {
      return demosaic::demosaic_to_mono8(&raw, demosaic_method);
    }
    let rgb_fmt = if bits == 8 { PixelFormat::Rgb8 } else { PixelFormat::Rgb16 };
    let rgb = demosaic::demosaic_to_rgb(&raw, demosaic_method)?;
    if dest_fmt == rgb_fmt {
      return Ok(rgb);
    }
    return rgb.convert_pix_fmt(dest_fmt, demosaic_method);
  }

  // Copy the given rectangle of `self` into a new image of size
  // dest_width x dest_height at (dest_x, dest_y). Both the source and the
  // destination rectangle are clipped independently; when `clear_to_zero`
  // is set, destination pixels outside the copied area are zero-filled
  // (they are zero anyway in the freshly allocated result, the flag is
  // kept for parity with the in-place variant of the operation).
  pub fn resize_and_translate(&self,
                              src_x: i32, src_y: i32, width: u32, height: u32,
                              dest_x: i32, dest_y: i32,
                              dest_width: u32, dest_height: u32,
                              clear_to_zero: bool) -> Result<Image> {
    let mut out = Image::new(dest_width, dest_height, self.pix_fmt, self.palette().cloned())?;
    let _ = clear_to_zero;

    let src_rect = Rect::new(src_x, src_y, width, height).intersect(&self.rect());
    if src_rect.is_empty() {
      return Ok(out);
    }

    // Shift the clipped source rectangle into destination space and clip again
    let dst_rect = Rect::new(dest_x + (src_rect.x - src_x), dest_y + (src_rect.y - src_y),
                             src_rect.width, src_rect.height)
                     .intersect(&out.rect());
    if dst_rect.is_empty() {
      return Ok(out);
    }

    let bpp = self.pix_fmt.bytes_per_pixel();
    let src_x0 = (src_rect.x + (dst_rect.x - (dest_x + (src_rect.x - src_x)))) as usize;
    let src_y0 = (src_rect.y + (dst_rect.y - (dest_y + (src_rect.y - src_y)))) as usize;
    for row in 0..dst_rect.height {
      let src_line = self.line(src_y0 as u32 + row);
      let src_bytes = &src_line[src_x0 * bpp .. (src_x0 + dst_rect.width as usize) * bpp];
      let dst_line = out.line_mut((dst_rect.y as u32) + row);
      dst_line[dst_rect.x as usize * bpp .. (dst_rect.x as usize + dst_rect.width as usize) * bpp]
        .copy_from_slice(src_bytes);
    }
    return Ok(out);
  }

  // Same-format copy of a sub-rectangle (must lie within the image)
  pub fn fragment(&self, rect: Rect) -> Result<Image> {
    if rect.x < 0 || rect.y < 0
       || rect.right() > self.width as i32 || rect.bottom() > self.height as i32 {
      return Err(Error::InvalidParameters("fragment rectangle outside the image"));
    }
    self.resize_and_translate(rect.x, rect.y, rect.width, rect.height,
                              0, 0, rect.width, rect.height, false)
  }
}

// A single sample value in one of the four storage types
#[derive(Clone, Copy)]
enum Sample {
  U8(u8),
  U16(u16),
  F32(f32),
  F64(f64)
}

// Depth conversion of one sample. Integer widening is a left shift,
// integer narrowing a right shift; integers normalize to [0, 1] floats.
// Floats are clamped only when written to an integer type.
fn convert_sample(s: Sample, dst: SampleType) -> Sample {
  use Sample::*;
  match (s, dst) {
    (U8(v), SampleType::U8) => U8(v),
    (U8(v), SampleType::U16) => U16((v as u16) << 8),
    (U8(v), SampleType::F32) => F32(v as f32 / 255.0),
    (U8(v), SampleType::F64) => F64(v as f64 / 255.0),

    (U16(v), SampleType::U8) => U8((v >> 8) as u8),
    (U16(v), SampleType::U16) => U16(v),
    (U16(v), SampleType::F32) => F32(v as f32 / 65535.0),
    (U16(v), SampleType::F64) => F64(v as f64 / 65535.0),

    (F32(v), SampleType::U8) => U8((v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8),
    (F32(v), SampleType::U16) => U16((v.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16),
    (F32(v), SampleType::F32) => F32(v),
    (F32(v), SampleType::F64) => F64(v as f64),

    (F64(v), SampleType::U8) => U8((v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8),
    (F64(v), SampleType::U16) => U16((v.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16),
    (F64(v), SampleType::F32) => F32(v as f32),
    (F64(v), SampleType::F64) => F64(v)
  }
}

// Channel mean in the source's own numeric range. For replicated mono
// samples this returns the sample unchanged.
fn mean3(c: [Sample; 3]) -> Sample {
  use Sample::*;
  match (c[0], c[1], c[2]) {
    (U8(r), U8(g), U8(b)) => U8(((r as u32 + g as u32 + b as u32) / 3) as u8),
    (U16(r), U16(g), U16(b)) => U16(((r as u32 + g as u32 + b as u32) / 3) as u16),
    (F32(r), F32(g), F32(b)) => F32((r + g + b) / 3.0),
    (F64(r), F64(g), F64(b)) => F64((r + g + b) / 3.0),
    _ => unreachable!("channels of one pixel share a sample type")
  }
}

// Read pixel `x` of a line as an (R, G, B) triple in the source sample
// type; mono formats replicate, Pal8 goes through the palette, the alpha
// of Bgra8/Rgba16 is ignored
fn read_pixel_rgb(line: &[u8], x: usize, fmt: PixelFormat,
                  palette: Option<&Palette>) -> [Sample; 3] {
  use PixelFormat::*;
  use Sample::*;
  match fmt {
    Mono8 => {
      let v = U8(line[x]);
      [v, v, v]
    },
    Pal8 => {
      // No-palette images read as grayscale indices
      match palette {
        Some(pal) => {
          let (r, g, b) = pal.rgb(line[x]);
          [U8(r), U8(g), U8(b)]
        },
        None => {
          let v = U8(line[x]);
          [v, v, v]
        }
      }
    },
    Rgb8 => [U8(line[3*x]), U8(line[3*x + 1]), U8(line[3*x + 2])],
    Bgra8 => [U8(line[4*x + 2]), U8(line[4*x + 1]), U8(line[4*x])],
    Mono16 => {
      let v = U16(read_u16(line, x));
      [v, v, v]
    },
    Rgb16 => [U16(read_u16(line, 3*x)), U16(read_u16(line, 3*x + 1)), U16(read_u16(line, 3*x + 2))],
    Rgba16 => [U16(read_u16(line, 4*x)), U16(read_u16(line, 4*x + 1)), U16(read_u16(line, 4*x + 2))],
    Mono32f => {
      let v = F32(read_f32(line, x));
      [v, v, v]
    },
    Rgb32f => [F32(read_f32(line, 3*x)), F32(read_f32(line, 3*x + 1)), F32(read_f32(line, 3*x + 2))],
    Mono64f => {
      let v = F64(read_f64(line, x));
      [v, v, v]
    },
    Rgb64f => [F64(read_f64(line, 3*x)), F64(read_f64(line, 3*x + 1)), F64(read_f64(line, 3*x + 2))],
    Invalid | CfaRggb8 | CfaGrbg8 | CfaGbrg8 | CfaBggr8
      | CfaRggb16 | CfaGrbg16 | CfaGbrg16 | CfaBggr16 => {
      unreachable!("CFA and invalid sources are handled before the per-pixel loop")
    }
  }
}

// Write one pixel; `c` must already be in the destination sample type.
// Bgra8 receives opaque alpha, as does Rgba16.
fn write_pixel(line: &mut [u8], x: usize, fmt: PixelFormat, c: [Sample; 3]) {
  use PixelFormat::*;
  match fmt {
    Mono8 => line[x] = as_u8(c[0]),
    Rgb8 => {
      line[3*x] = as_u8(c[0]);
      line[3*x + 1] = as_u8(c[1]);
      line[3*x + 2] = as_u8(c[2]);
    },
    Bgra8 => {
      line[4*x] = as_u8(c[2]);
      line[4*x + 1] = as_u8(c[1]);
      line[4*x + 2] = as_u8(c[0]);
      line[4*x + 3] = 0xFF;
    },
    Mono16 => write_u16(line, x, as_u16(c[0])),
    Rgb16 => {
      write_u16(line, 3*x, as_u16(c[0]));
      write_u16(line, 3*x + 1, as_u16(c[1]));
      write_u16(line, 3*x + 2, as_u16(c[2]));
    },
    Rgba16 => {
      write_u16(line, 4*x, as_u16(c[0]));
      write_u16(line, 4*x + 1, as_u16(c[1]));
      write_u16(line, 4*x + 2, as_u16(c[2]));
      write_u16(line, 4*x + 3, 0xFFFF);
    },
    Mono32f => write_f32(line, x, as_f32(c[0])),
    Rgb32f => {
      write_f32(line, 3*x, as_f32(c[0]));
      write_f32(line, 3*x + 1, as_f32(c[1]));
      write_f32(line, 3*x + 2, as_f32(c[2]));
    },
    Mono64f => write_f64(line, x, as_f64(c[0])),
    Rgb64f => {
      write_f64(line, 3*x, as_f64(c[0]));
      write_f64(line, 3*x + 1, as_f64(c[1]));
      write_f64(line, 3*x + 2, as_f64(c[2]));
    },
    _ => unreachable!("destination format was validated before the per-pixel loop")
  }
}

fn as_u8(s: Sample) -> u8 {
  match s { Sample::U8(v) => v, _ => unreachable!() }
}

fn as_u16(s: Sample) -> u16 {
  match s { Sample::U16(v) => v, _ => unreachable!() }
}

fn as_f32(s: Sample) -> f32 {
  match s { Sample::F32(v) => v, _ => unreachable!() }
}

fn as_f64(s: Sample) -> f64 {
  match s { Sample::F64(v) => v, _ => unreachable!() }
}

fn read_u16(line: &[u8], index: usize) -> u16 {
  u16::from_ne_bytes(line[2*index .. 2*index + 2].try_into().unwrap())
}

fn write_u16(line: &mut [u8], index: usize, v: u16) {
  line[2*index .. 2*index + 2].copy_from_slice(&v.to_ne_bytes());
}

fn read_f32(line: &[u8], index: usize) -> f32 {
  f32::from_ne_bytes(line[4*index .. 4*index + 4].try_into().unwrap())
}

fn write_f32(line: &mut [u8], index: usize, v: f32) {
  line[4*index .. 4*index + 4].copy_from_slice(&v.to_ne_bytes());
}

fn read_f64(line: &[u8], index: usize) -> f64 {
  f64::from_ne_bytes(line[8*index .. 8*index + 8].try_into().unwrap())
}

fn write_f64(line: &mut [u8], index: usize, v: f64) {
  line[8*index .. 8*index + 8].copy_from_slice(&v.to_ne_bytes());
}

#[cfg(test)]
mod tests {
  use super::*;

  fn gradient_mono8(width: u32, height: u32) -> Image {
    let mut img = Image::new(width, height, PixelFormat::Mono8, None).unwrap();
    for y in 0..height {
      for x in 0..width {
        img.line_mut(y)[x as usize] = ((7 * x + 13 * y) % 256) as u8;
      }
    }
    return img;
  }

  #[test]
  fn widening_round_trip_mono8_mono16() {
    let img = gradient_mono8(17, 9);
    let wide = img.convert_pix_fmt(PixelFormat::Mono16, DemosaicMethod::Simple).unwrap();
    let back = wide.convert_pix_fmt(PixelFormat::Mono8, DemosaicMethod::Simple).unwrap();
    for y in 0..9 {
      assert_eq!(img.line(y), back.line(y));
    }
  }

  #[test]
  fn widening_round_trip_mono8_float() {
    let img = gradient_mono8(16, 8);
    for fmt in [PixelFormat::Mono32f, PixelFormat::Mono64f] {
      let wide = img.convert_pix_fmt(fmt, DemosaicMethod::Simple).unwrap();
      let back = wide.convert_pix_fmt(PixelFormat::Mono8, DemosaicMethod::Simple).unwrap();
      for y in 0..8 {
        assert_eq!(img.line(y), back.line(y), "through {:?}", fmt);
      }
    }
  }

  #[test]
  fn same_format_conversion_is_identity() {
    let img = gradient_mono8(11, 5);
    let copy = img.convert_pix_fmt(PixelFormat::Mono8, DemosaicMethod::Simple).unwrap();
    assert_eq!(img.pixels(), copy.pixels());
  }

  #[test]
  fn mono_to_color_replicates_with_opaque_alpha() {
    let img = gradient_mono8(4, 4);
    let bgra = img.convert_pix_fmt(PixelFormat::Bgra8, DemosaicMethod::Simple).unwrap();
    for y in 0..4 {
      for x in 0..4usize {
        let v = img.line(y)[x];
        let px = &bgra.line(y)[4*x .. 4*x + 4];
        assert_eq!(px, [v, v, v, 0xFF]);
      }
    }
  }

  #[test]
  fn color_to_mono_averages() {
    let mut img = Image::new(1, 1, PixelFormat::Rgb8, None).unwrap();
    img.line_mut(0).copy_from_slice(&[10, 20, 33]);
    let mono = img.convert_pix_fmt(PixelFormat::Mono8, DemosaicMethod::Simple).unwrap();
    assert_eq!(mono.line(0)[0], 21);
  }

  #[test]
  fn pal8_goes_through_palette() {
    let mut pal = Palette::new();
    pal.entries[3*7] = 30;
    pal.entries[3*7 + 1] = 60;
    pal.entries[3*7 + 2] = 90;
    let mut img = Image::new(1, 1, PixelFormat::Pal8, Some(pal)).unwrap();
    img.line_mut(0)[0] = 7;
    let rgb = img.convert_pix_fmt(PixelFormat::Rgb8, DemosaicMethod::Simple).unwrap();
    assert_eq!(rgb.line(0), [30, 60, 90]);
    let mono = img.convert_pix_fmt(PixelFormat::Mono8, DemosaicMethod::Simple).unwrap();
    assert_eq!(mono.line(0)[0], 60);
  }

  #[test]
  fn resize_and_translate_identity() {
    let img = gradient_mono8(13, 7);
    let copy = img.resize_and_translate(0, 0, 13, 7, 0, 0, 13, 7, false).unwrap();
    assert_eq!(img.pixels(), copy.pixels());
  }

  #[test]
  fn resize_and_translate_clips_both_sides() {
    let img = gradient_mono8(8, 8);
    // Source rectangle hangs over the top-left corner: it clips to (0,0,4,4)
    // and the copy lands at (3,3) in the destination, clipped to 2x2 there
    let out = img.resize_and_translate(-2, -2, 6, 6, 1, 1, 5, 5, true).unwrap();
    for y in 0..5u32 {
      for x in 0..5usize {
        let expected = if x >= 3 && y >= 3 {
          img.line(y - 3)[x - 3]
        } else {
          0
        };
        assert_eq!(out.line(y)[x], expected, "at ({}, {})", x, y);
      }
    }
  }

  #[test]
  fn grayscale_palette_detection() {
    let mut pal = Palette::new();
    for i in 0..256usize {
      pal.entries[3*i] = i as u8;
      pal.entries[3*i + 1] = i as u8;
      pal.entries[3*i + 2] = i as u8;
    }
    assert!(palette_is_grayscale(&pal));
    pal.entries[3*100] = 99;
    assert!(!palette_is_grayscale(&pal));
  }

  #[test]
  fn reinterpret_changes_tag_only() {
    let mut img = gradient_mono8(6, 6);
    let before = img.pixels().to_vec();
    img.reinterpret_as_cfa(CfaPattern::Grbg).unwrap();
    assert_eq!(img.pix_fmt(), PixelFormat::CfaGrbg8);
    assert_eq!(img.pixels(), &before[..]);
  }
}
