//! Image types and JPEG decoding.

use std::{
    env::{self, VarError},
    fmt,
    process,
    sync::OnceLock,
};

use anyhow::bail;
use image::{ImageBuffer, RgbaImage};

/// Because computers, we support more than one JPEG decoding backend.
#[derive(Debug, Clone, Copy)]
enum JpegBackend {
    /// Uses the `jpeg-decoder` crate, a robust but slow pure-Rust JPEG decoder.
    JpegDecoder,
    /// Uses the `zune-jpeg` crate, a pure-Rust JPEG decoder somewhat faster than `jpeg-decoder`.
    ZuneJpeg,
}

const DEFAULT_BACKEND: JpegBackend = JpegBackend::JpegDecoder;

fn jpeg_backend() -> JpegBackend {
    static BACKEND: OnceLock<JpegBackend> = OnceLock::new();
    *BACKEND.get_or_init(|| match env::var("CAMVIEW_JPEG_BACKEND") {
        Ok(v) if v == "jpeg-decoder" => JpegBackend::JpegDecoder,
        Ok(v) if v == "zune-jpeg" => JpegBackend::ZuneJpeg,
        Ok(v) => {
            eprintln!("invalid value set for `CAMVIEW_JPEG_BACKEND` variable: '{v}'; exiting");
            process::exit(1);
        }
        Err(VarError::NotPresent) => DEFAULT_BACKEND,
        Err(VarError::NotUnicode(s)) => {
            eprintln!(
                "invalid value set for `CAMVIEW_JPEG_BACKEND` variable: {}; exiting",
                s.to_string_lossy()
            );
            process::exit(1);
        }
    })
}

/// An 8-bit sRGB image with alpha channel.
///
/// One [`Image`] holds one decoded camera frame.
#[derive(Clone)]
pub struct Image {
    // Internal representation is meant to be compatible with wgpu's texture formats for easy GPU
    // uploading.
    buf: RgbaImage,
}

impl Image {
    /// Creates an empty image of a specified size.
    ///
    /// The image will start out black and fully transparent.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buf: ImageBuffer::new(width, height),
        }
    }

    /// Decodes a JFIF JPEG or Motion JPEG from a byte slice.
    pub fn decode_jpeg(data: &[u8]) -> anyhow::Result<Self> {
        Self::decode_jpeg_with(jpeg_backend(), data)
    }

    fn decode_jpeg_with(backend: JpegBackend, data: &[u8]) -> anyhow::Result<Self> {
        let buf = match backend {
            JpegBackend::JpegDecoder => {
                image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgba8()
            }
            JpegBackend::ZuneJpeg => {
                use zune_jpeg::zune_core::colorspace::ColorSpace;
                use zune_jpeg::zune_core::options::DecoderOptions;

                let mut decomp = zune_jpeg::JpegDecoder::new_with_options(
                    DecoderOptions::new_fast().jpeg_set_out_colorspace(ColorSpace::RGBA),
                    data,
                );
                decomp.decode_headers()?;
                let colorspace = decomp.get_output_colorspace().unwrap();
                if colorspace != ColorSpace::RGBA {
                    bail!("unsupported colorspace {colorspace:?} (expected RGBA)");
                }

                let mut buf = vec![0; decomp.output_buffer_size().unwrap()];
                decomp.decode_into(&mut buf)?;
                let (width, height) = decomp.dimensions().unwrap();
                ImageBuffer::from_raw(width.into(), height.into(), buf)
                    .expect("failed to create ImageBuffer")
            }
        };

        Ok(Self { buf })
    }

    /// Returns the width of this image, in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.buf.width()
    }

    /// Returns the height of this image, in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.buf.height()
    }

    /// Returns the size of this image.
    #[inline]
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }

    /// Returns the raw RGBA data of this image, row-major.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.buf.as_raw()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({})", self.resolution())
    }
}

/// Resolution (`width x height`) of an image, window, or camera mode.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    /// Creates a new [`Resolution`] of `width x height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns the width of this [`Resolution`].
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Returns the height of this [`Resolution`].
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn num_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_jpeg(width: u32, height: u32) -> Vec<u8> {
        let buf = image::RgbImage::from_pixel(width, height, image::Rgb([20, 40, 60]));
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new(&mut out)
            .encode(buf.as_raw(), width, height, image::ColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn decode_jpeg_dimensions() {
        for backend in [JpegBackend::JpegDecoder, JpegBackend::ZuneJpeg] {
            let image = Image::decode_jpeg_with(backend, &encode_jpeg(16, 8)).unwrap();
            assert_eq!(image.resolution(), Resolution::new(16, 8));
            assert_eq!(image.data().len(), 16 * 8 * 4);
        }
    }

    #[test]
    fn decode_jpeg_rejects_garbage() {
        for backend in [JpegBackend::JpegDecoder, JpegBackend::ZuneJpeg] {
            assert!(Image::decode_jpeg_with(backend, &[0xff, 0xd8, 0xff]).is_err());
        }
    }

    #[test]
    fn blank_image_is_transparent() {
        let image = Image::new(4, 4);
        assert!(image.data().iter().all(|&b| b == 0));
    }
}
