pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;
pub mod value;

use crate::frame::frame_errors::FrameError;
use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;
use std::fmt::Display;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use request::SerializableRequest;
use response::ResponseOpcode;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

/// Default limit on the size of a single frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Version of the native protocol spoken on a connection.
///
/// The driver starts negotiation at the newest version it knows and walks
/// down when the server refuses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V2,
    V3,
    V4,
}

impl ProtocolVersion {
    pub const NEWEST: ProtocolVersion = ProtocolVersion::V4;

    pub const fn as_byte(self) -> u8 {
        match self {
            ProtocolVersion::V2 => 0x02,
            ProtocolVersion::V3 => 0x03,
            ProtocolVersion::V4 => 0x04,
        }
    }

    pub fn from_byte(byte: u8) -> Option<ProtocolVersion> {
        match byte {
            0x02 => Some(ProtocolVersion::V2),
            0x03 => Some(ProtocolVersion::V3),
            0x04 => Some(ProtocolVersion::V4),
            _ => None,
        }
    }

    /// The next older version, used when the server refuses this one.
    pub fn downgrade(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V2 => None,
        }
    }

    /// Header size: v2 uses a single-byte stream id, v3+ two bytes.
    pub const fn header_size(self) -> usize {
        match self {
            ProtocolVersion::V2 => 8,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 9,
        }
    }

    /// Size of the per-connection stream id pool.
    pub const fn stream_id_count(self) -> usize {
        match self {
            ProtocolVersion::V2 => 128,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 32768,
        }
    }

    pub const fn supports_unset_values(self) -> bool {
        matches!(self, ProtocolVersion::V4)
    }

    pub const fn supports_default_timestamp(self) -> bool {
        !matches!(self, ProtocolVersion::V2)
    }

    pub const fn supports_custom_payload(self) -> bool {
        matches!(self, ProtocolVersion::V4)
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Lz4 => f.write_str("lz4"),
            Compression::Snappy => f.write_str("snappy"),
        }
    }
}

/// A request frame, fully encoded except for its stream id.
pub struct SerializedRequest {
    version: ProtocolVersion,
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, FrameError> {
        let header_size = version.header_size();
        let mut flags = 0;
        let mut data = vec![0; header_size];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let mut body = Vec::new();
            req.serialize(version, &mut body)?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(version, &mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version.as_byte();
        data[1] = flags;
        // Stream id bytes are left zeroed until set_stream is called.
        data[header_size - 5] = R::OPCODE as u8;

        let req_size = (data.len() - header_size) as u32;
        data[header_size - 4..header_size].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { version, data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        match self.version {
            ProtocolVersion::V2 => self.data[2] = stream as i8 as u8,
            ProtocolVersion::V3 | ProtocolVersion::V4 => {
                self.data[2..4].copy_from_slice(&stream.to_be_bytes())
            }
        }
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// Parts of the frame header which are not determined by the frame type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: ProtocolVersion,
    pub flags: u8,
    pub stream: i16,
}

/// Reads a single response frame from the stream.
///
/// The header is validated against the negotiated protocol version and the
/// body length is checked against `max_frame_size` before any allocation.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
    max_frame_size: usize,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let header_size = version.header_size();
    let mut raw_header = [0u8; 9];
    reader.read_exact(&mut raw_header[..header_size]).await?;

    let mut buf = &raw_header[..header_size];

    let version_byte = buf.get_u8();
    if version_byte & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    if version_byte & 0x7F != version.as_byte() {
        return Err(FrameError::VersionNotSupported(version_byte & 0x7F));
    }

    let flags = buf.get_u8();
    let stream = match version {
        ProtocolVersion::V2 => buf.get_i8() as i16,
        ProtocolVersion::V3 | ProtocolVersion::V4 => buf.get_i16(),
    };

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode_byte = buf.get_u8();
    let opcode = ResponseOpcode::try_from(opcode_byte)
        .map_err(|_| FrameError::UnknownResponseOpcode(opcode_byte))?;

    let length = buf.get_u32() as usize;
    if length > max_frame_size {
        return Err(FrameError::FrameTooLarge(length, max_frame_size));
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// The parts of a response body that the frame flags prepend to the
/// opcode-specific payload.
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf).map_err(frame_errors::ParseError::from)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = comp_body.get_u32() as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)?;
            Ok(uncomp_body)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::request::Options;

    #[test]
    fn lz4_round_trip() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        compress_append(uncomp_body.as_bytes(), Compression::Lz4, &mut comp_body).unwrap();
        let result = decompress(&comp_body[..], Compression::Lz4).unwrap();
        assert!(comp_body.len() < uncomp_body.len());
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn snappy_round_trip() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        compress_append(uncomp_body.as_bytes(), Compression::Snappy, &mut comp_body).unwrap();
        let result = decompress(&comp_body[..], Compression::Snappy).unwrap();
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn header_layout_v4() {
        let mut req = SerializedRequest::make(&Options, ProtocolVersion::V4, None, false).unwrap();
        req.set_stream(0x0102);
        let data = req.get_data();
        assert_eq!(data.len(), 9);
        assert_eq!(data[0], 0x04);
        assert_eq!(data[1], 0x00);
        assert_eq!(&data[2..4], &[0x01, 0x02]);
        assert_eq!(data[4], 0x05); // OPTIONS
        assert_eq!(&data[5..9], &[0, 0, 0, 0]);
    }

    #[test]
    fn header_layout_v2() {
        let mut req = SerializedRequest::make(&Options, ProtocolVersion::V2, None, false).unwrap();
        req.set_stream(0x42);
        let data = req.get_data();
        assert_eq!(data.len(), 8);
        assert_eq!(data[0], 0x02);
        assert_eq!(data[2], 0x42);
        assert_eq!(data[3], 0x05); // OPTIONS
        assert_eq!(&data[4..8], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn response_frame_round_trip() {
        // READY response: header only, empty body.
        let frame: &[u8] = &[0x84, 0x00, 0x00, 0x07, 0x02, 0x00, 0x00, 0x00, 0x00];
        let mut reader = frame;
        let (params, opcode, body) =
            read_response_frame(&mut reader, ProtocolVersion::V4, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
        assert_eq!(params.stream, 7);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn response_frame_rejects_request_direction() {
        let frame: &[u8] = &[0x04, 0x00, 0x00, 0x07, 0x02, 0x00, 0x00, 0x00, 0x00];
        let mut reader = frame;
        let res =
            read_response_frame(&mut reader, ProtocolVersion::V4, DEFAULT_MAX_FRAME_SIZE).await;
        assert!(matches!(res, Err(FrameError::FrameFromClient)));
    }

    #[tokio::test]
    async fn response_frame_enforces_max_size() {
        let frame: &[u8] = &[0x84, 0x00, 0x00, 0x07, 0x02, 0x7F, 0xFF, 0xFF, 0xFF];
        let mut reader = frame;
        let res = read_response_frame(&mut reader, ProtocolVersion::V4, 1024).await;
        assert!(matches!(res, Err(FrameError::FrameTooLarge(_, 1024))));
    }

    #[tokio::test]
    async fn response_frame_truncated_body() {
        // Header declares 4 bytes of body, only 2 follow.
        let frame: &[u8] = &[
            0x84, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x04, 0xAA, 0xBB,
        ];
        let mut reader = frame;
        let res =
            read_response_frame(&mut reader, ProtocolVersion::V4, DEFAULT_MAX_FRAME_SIZE).await;
        assert!(matches!(res, Err(FrameError::ConnectionClosed(2, 4))));
    }

    #[test]
    fn version_negotiation_ladder() {
        assert_eq!(ProtocolVersion::V4.downgrade(), Some(ProtocolVersion::V3));
        assert_eq!(ProtocolVersion::V3.downgrade(), Some(ProtocolVersion::V2));
        assert_eq!(ProtocolVersion::V2.downgrade(), None);
        assert_eq!(ProtocolVersion::V2.stream_id_count(), 128);
        assert_eq!(ProtocolVersion::V4.stream_id_count(), 32768);
    }
}
