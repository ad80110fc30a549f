use crate::{
    config::Config,
    error::{Result, YamuxError},
    frame::{
        Flags, Frame, FrameHeader, FrameType, HEADER_SIZE, INITIAL_WINDOW_SIZE, PROTOCOL_VERSION,
    },
};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    ReadingHeader,
    ReadingPayload { header: FrameHeader },
}

/// Frame codec for the 12-byte yamux header.
///
/// Decoding is incremental: the header is parsed and validated as soon as 12
/// bytes are buffered, and a data frame is only yielded once its whole payload
/// has arrived. A version mismatch is reported immediately, before any payload
/// is consumed.
#[derive(Debug, Clone)]
pub struct Codec {
    state: DecodeState,
    max_frame_size: usize,
}

impl Codec {
    pub fn new(config: &Config) -> Self {
        // A peer can never be granted more credit than our largest window.
        let max_frame_size = config.max_window_size.max(INITIAL_WINDOW_SIZE) as usize;
        Self {
            state: DecodeState::ReadingHeader,
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn decode_header(src: &mut BytesMut) -> Result<FrameHeader> {
        let version = src.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(YamuxError::InvalidVersion(version));
        }
        let frame_type = FrameType::from_byte(src.get_u8())?;
        let flags = Flags::from_bits_retain(src.get_u16());
        let stream_id = src.get_u32();
        let length = src.get_i32();

        Ok(FrameHeader {
            version,
            frame_type,
            flags,
            stream_id,
            length,
        })
    }

    fn encode_header(dst: &mut BytesMut, header: &FrameHeader) {
        dst.put_u8(header.version);
        dst.put_u8(header.frame_type.to_byte());
        dst.put_u16(header.flags.bits());
        dst.put_u32(header.stream_id);
        dst.put_i32(header.length);
    }

    fn payload_len(&self, header: &FrameHeader) -> Result<usize> {
        if header.length < 0 {
            return Err(YamuxError::InvalidFrame);
        }
        let len = header.length as usize;
        if len > self.max_frame_size {
            return Err(YamuxError::FrameTooLarge {
                size: HEADER_SIZE + len,
                max: self.max_frame_size,
            });
        }
        Ok(len)
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = YamuxError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::ReadingHeader => {
                    if src.len() < HEADER_SIZE {
                        src.reserve(HEADER_SIZE - src.len());
                        return Ok(None);
                    }

                    let header = Self::decode_header(src)?;
                    if !header.frame_type.carries_payload() {
                        return Ok(Some(Frame {
                            header,
                            data: Default::default(),
                        }));
                    }

                    let len = self.payload_len(&header)?;
                    src.reserve(len.saturating_sub(src.len()));
                    self.state = DecodeState::ReadingPayload { header };
                }
                DecodeState::ReadingPayload { header } => {
                    let len = header.length as usize;
                    if src.len() < len {
                        return Ok(None);
                    }

                    let data = src.split_to(len).freeze();
                    self.state = DecodeState::ReadingHeader;
                    return Ok(Some(Frame { header, data }));
                }
            }
        }
    }

    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.state {
            DecodeState::ReadingHeader if src.is_empty() => Ok(None),
            DecodeState::ReadingHeader => Err(YamuxError::UnexpectedEof { header: None }),
            DecodeState::ReadingPayload { header } => Err(YamuxError::UnexpectedEof {
                header: Some(header),
            }),
        }
    }
}

impl Encoder<Frame> for Codec {
    type Error = YamuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        frame.validate()?;

        dst.reserve(frame.total_size());
        Self::encode_header(dst, &frame.header);
        if frame.header.frame_type.carries_payload() {
            dst.put_slice(&frame.data);
        }

        Ok(())
    }
}
