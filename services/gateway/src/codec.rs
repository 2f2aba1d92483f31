//! Frame codec for the host-link socket: UTF-8 JSON messages terminated by
//! a single `0x03` (end-of-text) byte.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const FRAME_TERMINATOR: u8 = 0x03;

#[derive(Debug, Default)]
pub struct HostFrameCodec;

impl Decoder for HostFrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<BytesMut>> {
        let Some(pos) = src.iter().position(|b| *b == FRAME_TERMINATOR) else {
            return Ok(None);
        };
        let frame = src.split_to(pos);
        src.advance(1);
        Ok(Some(frame))
    }
}

impl Encoder<Vec<u8>> for HostFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> std::io::Result<()> {
        dst.reserve(item.len() + 1);
        dst.put_slice(&item);
        dst.put_u8(FRAME_TERMINATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_yields_nothing_without_terminator() {
        let mut codec = HostFrameCodec;
        let mut buf = BytesMut::from(&b"{\"id\":1}"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_splits_on_terminator_and_consumes_remainder() {
        let mut codec = HostFrameCodec;
        let mut buf = BytesMut::from(&b"{\"id\":1}\x03{\"id\":2}"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], b"{\"id\":1}");
        assert_eq!(&buf[..], b"{\"id\":2}");
    }

    #[test]
    fn encode_appends_terminator() {
        let mut codec = HostFrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(b"hello".to_vec(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"hello\x03");
    }
}
