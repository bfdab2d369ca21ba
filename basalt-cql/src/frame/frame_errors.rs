use thiserror::Error;

/// An error that occurred when reading or writing a whole frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is from the client's direction, expected a response")]
    FrameFromClient,
    #[error("Frame declares protocol version {0}, which is not supported")]
    VersionNotSupported(u8),
    #[error("Frame body length {0} exceeds the configured maximum of {1} bytes")]
    FrameTooLarge(usize, usize),
    #[error("Connection was closed before body was read: missing {0} out of {1} bytes")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed")]
    FrameDecompression,
    #[error("Frame compression failed")]
    FrameCompression,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Unknown response opcode: {0:#04x}")]
    UnknownResponseOpcode(u8),
    #[error("Frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    #[error(transparent)]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),
}

/// An error that occurred when parsing a frame body.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Could not parse received data: {0}")]
    BadIncomingData(String),
    #[error("Could not serialize frame: {0}")]
    BadDataToSerialize(String),
    #[error("Column type {0:#06x} is not implemented")]
    TypeNotImplemented(u16),
    #[error("Unset values require protocol v4, the connection negotiated {0}")]
    UnsetValueOnOldProtocol(crate::frame::ProtocolVersion),
    #[error("Default timestamps require protocol v3, the connection negotiated {0}")]
    TimestampOnOldProtocol(crate::frame::ProtocolVersion),
    #[error(transparent)]
    CqlTypeError(#[from] std::str::Utf8Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl From<std::num::TryFromIntError> for ParseError {
    fn from(err: std::num::TryFromIntError) -> Self {
        ParseError::BadIncomingData(format!("Integer conversion out of range: {err}"))
    }
}

impl From<std::array::TryFromSliceError> for ParseError {
    fn from(err: std::array::TryFromSliceError) -> Self {
        ParseError::BadIncomingData(format!("Slice of unexpected length: {err}"))
    }
}
