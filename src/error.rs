// Error and progress types shared by all pipeline stages

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

// Outcome of a successful stage step.  `LastStep` means the stage has
// consumed its final frame and its results can now be queried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
  More,
  LastStep
}

#[derive(Error, Debug)]
pub enum Error {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("cannot open file: {0}")]
  CannotOpenFile(String),

  #[error("cannot create file: {0}")]
  CannotCreateFile(String),

  #[error("unsupported file format: {0}")]
  UnsupportedFileFormat(String),

  #[error("malformed file")]
  MalformedFile,

  #[error("malformed BMP file: {0}")]
  BmpMalformed(&'static str),

  #[error("unsupported BMP format: {0}")]
  BmpUnsupported(&'static str),

  #[error("TIFF header incomplete")]
  TiffIncompleteHeader,

  #[error("unknown TIFF version")]
  TiffUnknownVersion,

  #[error("TIFF field incomplete")]
  TiffIncompleteField,

  #[error("TIFF channels have differing bit depths")]
  TiffDiffChannelBitDepths,

  #[error("compressed TIFF files are not supported")]
  TiffCompressed,

  #[error("unsupported TIFF planar configuration")]
  TiffUnsupportedPlanarConfig,

  #[error("TIFF pixel data incomplete")]
  TiffIncompletePixelData,

  #[error("malformed AVI file: {0}")]
  AviMalformed(&'static str),

  #[error("unsupported AVI format: {0}")]
  AviUnsupported(&'static str),

  #[error("malformed SER file: {0}")]
  SerMalformed(&'static str),

  #[error("unsupported SER format: {0}")]
  SerUnsupported(&'static str),

  #[error("invalid image dimensions")]
  InvalidDimensions,

  #[error("invalid parameters: {0}")]
  InvalidParameters(&'static str),

  #[error("image has no palette")]
  NoPalette,

  #[error("no more images")]
  NoMoreImages,

  #[error("unsupported pixel format: {0:?}")]
  UnsupportedPixelFormat(crate::image::PixelFormat),
}
