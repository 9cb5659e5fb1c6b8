use crate::datagroups::Datagroup;
use crate::packets::Packet;
use crate::{MscError, Result as MscResult};
use bytes::{Buf, BytesMut};
use log::warn;

/// A Codec used to Encode/Decode [Packet]s from Streams and Sinks.
/// This Codec can be useful when designing programs that must listen for
/// packets on an I/O device.
///
/// Packet boundaries are self-describing: the 2-bit length code in the
/// first byte sizes the frame. A frame failing its CRC is skipped, by a
/// single byte when `resync` is on (the default) so that the scan can
/// recover an unaligned stream, or by the declared frame size otherwise.
pub struct PacketCodec {
    resync: bool,
}

impl PacketCodec {
    pub fn new(resync: bool) -> Self {
        Self { resync }
    }

    fn decode_helper(&mut self, buffer: &mut BytesMut) -> MscResult<Option<Packet>> {
        loop {
            if buffer.remaining() < 3 {
                // Not enough bytes for a header
                return Ok(None);
            }

            // the 2-bit length code gives the total frame size
            let frame_length = ((buffer.as_ref()[0] >> 6) as usize + 1) * 24;

            match Packet::decode(buffer.as_ref()) {
                Ok(packet) => {
                    buffer.advance(frame_length);
                    return Ok(Some(packet));
                }
                Err(MscError::Incomplete) => {
                    // full packet has not yet arrived
                    // reserve enough bytes so we can fit it in the buffer
                    buffer.reserve(frame_length - buffer.remaining());

                    // Tell the frame we need more bytes
                    return Ok(None);
                }
                Err(error @ MscError::InvalidCrc { .. }) => {
                    warn!("skipping a packet frame failing its CRC: {error:}");
                    let skip = if self.resync { 1 } else { frame_length };
                    buffer.advance(skip.min(buffer.remaining()));
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(true)
    }
}

/// A Codec used to Encode/Decode [Datagroup]s from Streams and Sinks,
/// for use on streams where the packet layer has already been stripped.
///
/// The frame size is read from the 13-bit SegmentSize in the datagroup
/// header window; a frame failing its CRC is skipped as described on
/// [PacketCodec]. An unsupported header layout errors the stream.
pub struct DatagroupCodec {
    resync: bool,
}

impl DatagroupCodec {
    pub fn new(resync: bool) -> Self {
        Self { resync }
    }

    fn decode_helper(&mut self, buffer: &mut BytesMut) -> MscResult<Option<Datagroup>> {
        loop {
            if buffer.remaining() < 9 {
                // Not enough bytes for a header
                return Ok(None);
            }

            // header, segment (2-byte header plus the declared size), CRC
            let frame_length = crate::datagroups::declared_size(buffer.as_ref());

            match Datagroup::decode(buffer.as_ref()) {
                Ok(datagroup) => {
                    buffer.advance(frame_length);
                    return Ok(Some(datagroup));
                }
                Err(MscError::Incomplete) => {
                    // full datagroup has not yet arrived
                    // reserve enough bytes so we can fit it in the buffer
                    buffer.reserve(frame_length - buffer.remaining());

                    // Tell the frame we need more bytes
                    return Ok(None);
                }
                Err(error @ MscError::InvalidCrc { .. }) => {
                    warn!("skipping a datagroup frame failing its CRC: {error:}");
                    let skip = if self.resync { 1 } else { frame_length };
                    buffer.advance(skip.min(buffer.remaining()));
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for DatagroupCodec {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(feature = "async-codec")]
mod non_tokio {
    use super::*;

    use asynchronous_codec::{Decoder, Encoder};

    impl Decoder for PacketCodec {
        type Item = Packet;

        type Error = MscError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
            self.decode_helper(src)
        }
    }

    impl Encoder for PacketCodec {
        type Item = Packet;

        type Error = MscError;

        fn encode(
            &mut self,
            item: Self::Item,
            dst: &mut asynchronous_codec::BytesMut,
        ) -> Result<(), Self::Error> {
            let bytes = item.encode();
            dst.reserve(bytes.len());
            dst.extend(bytes);
            Ok(())
        }
    }

    impl Decoder for DatagroupCodec {
        type Item = Datagroup;

        type Error = MscError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
            self.decode_helper(src)
        }
    }

    impl Encoder for DatagroupCodec {
        type Item = Datagroup;

        type Error = MscError;

        fn encode(
            &mut self,
            item: Self::Item,
            dst: &mut asynchronous_codec::BytesMut,
        ) -> Result<(), Self::Error> {
            let bytes = item.encode();
            dst.reserve(bytes.len());
            dst.extend(bytes);
            Ok(())
        }
    }
}

#[cfg(feature = "tokio-codec")]
mod tokio_codec {
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    impl Decoder for PacketCodec {
        type Item = Packet;

        type Error = MscError;

        fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
            self.decode_helper(src)
        }
    }

    impl Encoder<Packet> for PacketCodec {
        type Error = MscError;

        fn encode(&mut self, item: Packet, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
            let bytes = item.encode();
            dst.reserve(bytes.len());
            dst.extend(bytes);
            Ok(())
        }
    }

    impl Decoder for DatagroupCodec {
        type Item = Datagroup;

        type Error = MscError;

        fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
            self.decode_helper(src)
        }
    }

    impl Encoder<Datagroup> for DatagroupCodec {
        type Error = MscError;

        fn encode(
            &mut self,
            item: Datagroup,
            dst: &mut bytes::BytesMut,
        ) -> Result<(), Self::Error> {
            let bytes = item.encode();
            dst.reserve(bytes.len());
            dst.extend(bytes);
            Ok(())
        }
    }
}

#[cfg(all(test, feature = "async-codec"))]
mod test {
    use super::*;

    use crate::datagroups::DatagroupType;
    use crate::packets::PacketSize;
    use crate::segmentation::{segment, SegmentingStrategy};

    use asynchronous_codec::Framed;
    use rstest::rstest;

    use futures::{executor, io::Cursor, SinkExt, TryStreamExt};

    fn datagroup(transport_id: u16, segment_index: u16, last: bool) -> Datagroup {
        let segments = segment(b"a test input", &SegmentingStrategy::default()).unwrap();
        Datagroup::new(
            transport_id,
            DatagroupType::Body,
            segments[0].clone(),
            segment_index,
            0,
            0,
            last,
        )
        .unwrap()
    }

    #[rstest]
    fn packet_codec_roundtrip(#[values(true, false)] resync: bool) {
        let expected = Packet::new(
            PacketSize::Size48,
            17,
            (0..40_u8).collect::<Vec<u8>>(),
            true,
            true,
            2,
        )
        .unwrap();

        let mut buf = vec![0_u8; 10];
        let buffer: Cursor<&mut Vec<u8>> = Cursor::new(&mut buf);

        let mut framed = Framed::new(buffer, PacketCodec::new(resync));

        executor::block_on(framed.send(expected.clone())).unwrap();

        // reset the buffer position
        let mut cursor = framed.into_inner();
        cursor.set_position(0);

        let mut framed = Framed::new(cursor, PacketCodec::new(resync));

        let recovered = executor::block_on(framed.try_next()).unwrap().unwrap();

        assert_eq!(expected, recovered)
    }

    #[rstest]
    fn datagroup_codec_roundtrip() {
        let expected = datagroup(12345, 0, true);

        let mut buf = vec![0_u8; 10];
        let buffer: Cursor<&mut Vec<u8>> = Cursor::new(&mut buf);

        let mut framed = Framed::new(buffer, DatagroupCodec::default());

        executor::block_on(framed.send(expected.clone())).unwrap();

        // reset the buffer position
        let mut cursor = framed.into_inner();
        cursor.set_position(0);

        let mut framed = Framed::new(cursor, DatagroupCodec::default());

        let recovered = executor::block_on(framed.try_next()).unwrap().unwrap();

        assert_eq!(expected, recovered);
        assert_eq!(expected.data(), recovered.data())
    }

    #[rstest]
    fn datagroup_codec_resyncs_over_a_spurious_byte() {
        let first = datagroup(1, 0, false);
        // the bytes after the spurious one read as a plausible header
        // declaring an empty segment, so the slip surfaces as a CRC
        // failure rather than a flag rejection
        let second = datagroup(256, 18, true);

        let mut buf = first.encode();
        buf.push(0x73);
        buf.extend(second.encode());

        let cursor: Cursor<&mut Vec<u8>> = Cursor::new(&mut buf);
        let mut framed = Framed::new(cursor, DatagroupCodec::default());

        let recovered = executor::block_on(framed.try_next()).unwrap().unwrap();
        assert_eq!(recovered.transport_id(), 1);

        let recovered = executor::block_on(framed.try_next()).unwrap().unwrap();
        assert_eq!(recovered.transport_id(), 256)
    }

    #[rstest]
    fn datagroup_codec_skips_a_nominal_frame_without_resync() {
        let first = datagroup(1, 0, false);
        let second = datagroup(2, 1, true);

        let mut buf = first.encode();
        // corrupt a payload byte of the first frame
        buf[12] ^= 0xFF;
        buf.extend(second.encode());

        let cursor: Cursor<&mut Vec<u8>> = Cursor::new(&mut buf);
        let mut framed = Framed::new(cursor, DatagroupCodec::new(false));

        let recovered = executor::block_on(framed.try_next()).unwrap().unwrap();
        assert_eq!(recovered.transport_id(), 2)
    }

    #[rstest]
    fn packet_codec_skips_a_nominal_frame_without_resync() {
        let first = Packet::new(PacketSize::Size24, 1, vec![0xAA; 19], true, false, 0).unwrap();
        let second = Packet::new(PacketSize::Size24, 1, vec![0xBB; 10], false, true, 1).unwrap();

        let mut buf = first.encode();
        // corrupt a data byte of the first packet
        buf[10] ^= 0xFF;
        buf.extend(second.encode());

        let cursor: Cursor<&mut Vec<u8>> = Cursor::new(&mut buf);
        let mut framed = Framed::new(cursor, PacketCodec::new(false));

        let recovered = executor::block_on(framed.try_next()).unwrap().unwrap();
        assert_eq!(second, recovered)
    }

    #[rstest]
    fn unsupported_datagroup_header_errors_the_stream(#[values(true, false)] resync: bool) {
        let mut buf = datagroup(7, 0, true).encode();
        // set the extension flag
        buf[0] |= 0x80;

        let cursor: Cursor<&mut Vec<u8>> = Cursor::new(&mut buf);
        let mut framed = Framed::new(cursor, DatagroupCodec::new(resync));

        assert!(executor::block_on(framed.try_next()).is_err())
    }
}
