use tracing::trace;

#[cfg(not(any(feature = "fast-jpeg", feature = "portable-jpeg")))]
compile_error!("enable the `fast-jpeg` or `portable-jpeg` feature for MJPEG decoding");

use super::frame::PixelFormat;
use super::packet::{Codec, Packet};
use crate::error::DecodeError;

/// Layout of an image a decoder wrote into a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes written at the start of the output buffer
    pub len: usize,
}

/// Turns one packet into pixels written straight into pool storage.
pub trait Decoder: Send {
    fn decode(&mut self, packet: &Packet, out: &mut [u8]) -> Result<DecodedImage, DecodeError>;
}

/// Software decoder for MJPEG and raw packets.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameDecoder {
    fn decode(&mut self, packet: &Packet, out: &mut [u8]) -> Result<DecodedImage, DecodeError> {
        if packet.payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        let image = match packet.codec {
            Codec::Mjpeg => decode_jpeg(&packet.payload, out)?,
            Codec::Raw {
                format,
                width,
                height,
            } => copy_raw(&packet.payload, format, width, height, out)?,
        };
        trace!(
            timestamp_us = packet.timestamp_us,
            width = image.width,
            height = image.height,
            "decoded unit"
        );
        Ok(image)
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<(), DecodeError> {
    if width == 0 || height == 0 {
        return Err(DecodeError::BadDimensions { width, height });
    }
    Ok(())
}

fn check_capacity(needed: usize, out: &[u8]) -> Result<(), DecodeError> {
    if needed > out.len() {
        return Err(DecodeError::TooLarge {
            needed,
            capacity: out.len(),
        });
    }
    Ok(())
}

fn copy_raw(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
    out: &mut [u8],
) -> Result<DecodedImage, DecodeError> {
    check_dimensions(width, height)?;
    let expected = format.frame_size(width, height);
    if data.len() != expected {
        return Err(DecodeError::SizeMismatch {
            format,
            expected,
            actual: data.len(),
        });
    }
    check_capacity(expected, out)?;

    // Already in a displayable layout
    out[..expected].copy_from_slice(data);
    Ok(DecodedImage {
        width,
        height,
        format,
        len: expected,
    })
}

#[cfg(feature = "fast-jpeg")]
fn decode_jpeg(data: &[u8], out: &mut [u8]) -> Result<DecodedImage, DecodeError> {
    use zune_jpeg::zune_core::colorspace::ColorSpace;
    use zune_jpeg::zune_core::options::DecoderOptions;
    use zune_jpeg::JpegDecoder;

    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(data, options);
    decoder
        .decode_headers()
        .map_err(|e| DecodeError::Jpeg(e.to_string()))?;

    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| DecodeError::Jpeg("missing image dimensions".into()))?;
    let (width, height) = (width as u32, height as u32);
    check_dimensions(width, height)?;

    let needed = decoder
        .output_buffer_size()
        .ok_or_else(|| DecodeError::Jpeg("unknown output size".into()))?;
    check_capacity(needed, out)?;

    decoder
        .decode_into(&mut out[..needed])
        .map_err(|e| DecodeError::Jpeg(e.to_string()))?;

    Ok(DecodedImage {
        width,
        height,
        format: PixelFormat::Rgb8,
        len: needed,
    })
}

#[cfg(all(feature = "portable-jpeg", not(feature = "fast-jpeg")))]
fn decode_jpeg(data: &[u8], out: &mut [u8]) -> Result<DecodedImage, DecodeError> {
    let mut decoder = jpeg_decoder::Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| DecodeError::Jpeg(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| DecodeError::Jpeg("missing image info".into()))?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));
    check_dimensions(width, height)?;

    let needed = PixelFormat::Rgb8.frame_size(width, height);
    check_capacity(needed, out)?;

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => out[..needed].copy_from_slice(&pixels),
        jpeg_decoder::PixelFormat::L8 => {
            for (rgb, &luma) in out[..needed].chunks_exact_mut(3).zip(pixels.iter()) {
                rgb.fill(luma);
            }
        }
        other => return Err(DecodeError::UnsupportedLayout(format!("{other:?}"))),
    }

    Ok(DecodedImage {
        width,
        height,
        format: PixelFormat::Rgb8,
        len: needed,
    })
}
