// Binary framing for streaming frames to the controller process. The
// header layout is bit-exact with the packed C struct of the existing
// receiver: fields in declaration order, little-endian, no padding.
//
//   width        u16
//   height       u16
//   temperature  i32   centidegrees
//   exposure_ms  u32
//   timestamp_ms u64
//   kind         i32
//   payload_len  i32
//
// Explicit encode/decode functions are used instead of transmuting a
// #[repr(C, packed)] struct; the layout is part of the protocol, not of
// this compiler's whims.

use canonical_error::{invalid_argument_error, CanonicalError};

use crate::image_data::ImageBuffer;

pub const FRAME_META_LEN: usize = 28;

/// Payload encodings understood by the receiver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    JpegMono = 15,
    JpegRgba = 20,
    JpegRgb = 25,
    Raw8 = 30,
    Raw16 = 35,
}

impl FrameKind {
    fn from_wire(value: i32) -> Result<FrameKind, CanonicalError> {
        match value {
            15 => Ok(FrameKind::JpegMono),
            20 => Ok(FrameKind::JpegRgba),
            25 => Ok(FrameKind::JpegRgb),
            30 => Ok(FrameKind::Raw8),
            35 => Ok(FrameKind::Raw16),
            other => Err(invalid_argument_error(
                &format!("Unknown frame kind {}", other))),
        }
    }
}

/// Channel tag distinguishing traffic classes on the transport link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelTag {
    /// Command from the controller.
    Command = 20,
    /// Frame data sent to the controller.
    Data = 21,
    /// Telemetry sent to the controller.
    Telemetry = 22,
}

/// Fixed metadata header preceding every frame payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameMeta {
    pub width: u16,
    pub height: u16,
    pub temperature_cdeg: i32,
    pub exposure_ms: u32,
    pub timestamp_ms: u64,
    pub kind: FrameKind,
    pub payload_len: i32,
}

impl FrameMeta {
    /// Header for a frame derived from `image` whose encoded payload is
    /// `payload_len` bytes.
    pub fn for_image(image: &ImageBuffer, kind: FrameKind, payload_len: usize)
                     -> FrameMeta {
        let meta = image.metadata();
        FrameMeta {
            width: image.width() as u16,
            height: image.height() as u16,
            temperature_cdeg: (meta.temperature * 100.0) as i32,
            exposure_ms: (meta.exposure as f64 * 1000.0).round() as u32,
            timestamp_ms: meta.timestamp_ms,
            kind,
            payload_len: payload_len as i32,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_META_LEN] {
        let mut buf = [0u8; FRAME_META_LEN];
        buf[0..2].copy_from_slice(&self.width.to_le_bytes());
        buf[2..4].copy_from_slice(&self.height.to_le_bytes());
        buf[4..8].copy_from_slice(&self.temperature_cdeg.to_le_bytes());
        buf[8..12].copy_from_slice(&self.exposure_ms.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf[20..24].copy_from_slice(&(self.kind as i32).to_le_bytes());
        buf[24..28].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<FrameMeta, CanonicalError> {
        if buf.len() < FRAME_META_LEN {
            return Err(invalid_argument_error(
                &format!("Frame header needs {} bytes, got {}",
                         FRAME_META_LEN, buf.len())));
        }
        Ok(FrameMeta {
            width: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            height: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            temperature_cdeg: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            exposure_ms: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            timestamp_ms: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            kind: FrameKind::from_wire(
                i32::from_le_bytes(buf[20..24].try_into().unwrap()))?,
            payload_len: i32::from_le_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// Header immediately followed by the payload bytes, ready to hand to a
/// transport sink.
pub fn encode_frame(meta: &FrameMeta, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_META_LEN + payload.len());
    buf.extend_from_slice(&meta.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Opaque transport accepting tagged byte buffers for a destination. The
/// wire protocol behind it is not this crate's concern.
pub trait TransportSink {
    fn send(&mut self, tag: ChannelTag, payload: &[u8], destination: u32)
            -> Result<(), CanonicalError>;
}

/// Compresses `image`'s preview and sends it as a tagged DATA frame.
pub fn publish_preview(image: &mut ImageBuffer, sink: &mut dyn TransportSink,
                       destination: u32) -> Result<(), CanonicalError> {
    let jpeg = image.preview_jpeg()?.to_vec();
    let meta = FrameMeta::for_image(image, FrameKind::JpegRgb, jpeg.len());
    sink.send(ChannelTag::Data, &encode_frame(&meta, &jpeg), destination)
}
