//! MSC data group framing as defined in EN 300 401, 5.3.3, and the two
//! MOT carriage modes of EN 301 234: header mode (interleaved header and
//! body datagroups per object) and directory mode (one aggregated
//! directory datagroup plus body datagroups).

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, trace, warn};

use crate::packets::{Packet, READ_CHUNK};
use crate::segmentation::{segment, SegmentingStrategy};
use crate::transport_id::{generate_transport_id, TransportIdGenerator};
use crate::{calculate_crc, MscError, Result};

pub(crate) type ErrorCallback<'a> = Box<dyn FnMut(&MscError) + 'a>;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The 4-bit DataGroupType values used by MOT carriage.
pub enum DatagroupType {
    /// An MOT header segment.
    Header = 3,
    /// An MOT body segment.
    Body = 4,
    /// A segment of an uncompressed MOT directory.
    DirectoryUncompressed = 6,
    /// A segment of a compressed MOT directory. The compression itself
    /// is applied by the collaborator building the directory bytes.
    DirectoryCompressed = 7,
}

impl DatagroupType {
    fn from_4bits(input: u8) -> Result<Self> {
        match input & 0x0F {
            3 => Ok(Self::Header),
            4 => Ok(Self::Body),
            6 => Ok(Self::DirectoryUncompressed),
            7 => Ok(Self::DirectoryCompressed),
            _ => Err(MscError::UnsupportedFeature("unknown datagroup type")),
        }
    }
}

#[derive(Clone, Debug)]
/// One MSC data group: a segment of a logical stream together with its
/// transport ID, session addressing and CRC protection.
pub struct Datagroup {
    transport_id: u16,
    datagroup_type: DatagroupType,
    data: Vec<u8>,
    segment_index: u16,
    continuity: u8,
    repetition: u8,
    last: bool,
}

/// Datagroups carrying the same segment of the same logical stream
/// compare equal, whatever their continuity or payload bytes.
impl PartialEq for Datagroup {
    fn eq(&self, other: &Self) -> bool {
        self.transport_id == other.transport_id
            && self.datagroup_type == other.datagroup_type
            && self.segment_index == other.segment_index
    }
}
impl Eq for Datagroup {}

impl Datagroup {
    /// Initialize a new datagroup. `data` is the segment to carry,
    /// including its 2-byte segment header.
    ///
    /// # Errors
    ///
    /// [MscError::InvalidArgument] under the following circumstances
    ///  - `segment_index` > 32767 (a 15-bit field)
    ///  - `repetition` > 15 (a 4-bit field)
    pub fn new(
        transport_id: u16,
        datagroup_type: DatagroupType,
        data: Vec<u8>,
        segment_index: u16,
        continuity: u8,
        repetition: u8,
        last: bool,
    ) -> Result<Self> {
        if segment_index > 0x7FFF {
            return Err(MscError::InvalidArgument(format!(
                "segment index must be <=32767 but found {segment_index:}"
            )));
        }
        if repetition > 0x0F {
            return Err(MscError::InvalidArgument(format!(
                "repetition index must be <=15 but found {repetition:}"
            )));
        }

        Ok(Self {
            transport_id,
            datagroup_type,
            data,
            segment_index,
            continuity,
            repetition,
            last,
        })
    }

    /// The transport ID tying this datagroup to its logical stream.
    pub fn transport_id(&self) -> u16 {
        self.transport_id
    }

    /// The 4-bit DataGroupType.
    pub fn datagroup_type(&self) -> DatagroupType {
        self.datagroup_type
    }

    /// Borrow the segment carried by the datagroup, including its 2-byte
    /// segment header.
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// The 15-bit index of this segment within its logical stream.
    pub fn segment_index(&self) -> u16 {
        self.segment_index
    }

    /// The 4-bit continuity index.
    pub fn continuity(&self) -> u8 {
        self.continuity
    }

    /// The 4-bit repetition index. Always zero on encode: segments are
    /// broadcast once, repetition scheduling is a transmission concern.
    pub fn repetition(&self) -> u8 {
        self.repetition
    }

    /// Whether this is the final segment of its logical stream.
    pub fn last(&self) -> bool {
        self.last
    }

    /// The total on-wire size: 7 header bytes, the segment, and the CRC.
    pub fn size(&self) -> usize {
        7 + self.data.len() + 2
    }

    /// Encode the datagroup into its byte array representation.
    /// Assumes Big Endian byte order.
    pub fn encode(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(self.size());

        // datagroup header: no extension, CRC present, segment header
        // present, user access field present, then the type
        message.push(0b0111_0000 | self.datagroup_type as u8);
        message.push((self.continuity & 0x0F) << 4 | (self.repetition & 0x0F));

        // session header: segment field
        let segment_field = (self.last as u16) << 15 | (self.segment_index & 0x7FFF);
        message.extend_from_slice(&segment_field.to_be_bytes());

        // user access field: 3 RFA bits, transport ID flag, then a
        // length indicator of 2 as only the transport ID follows
        message.push(0b0001_0010);
        message.extend_from_slice(&self.transport_id.to_be_bytes());

        message.extend_from_slice(&self.data);

        // 5.3.3.4: the CRC covers the datagroup header, the session
        // header and the data field
        message.extend_from_slice(&calculate_crc(&message).to_be_bytes());

        trace!("encoded datagroup {self:?} to {} bytes", message.len());
        message
    }

    /// Parse a datagroup from a byte array.
    /// Assumes Big Endian byte order.
    ///
    /// # Errors
    ///
    ///  - [MscError::Incomplete] when the buffer ends inside the frame
    ///  - [MscError::UnsupportedFeature] on header layouts this crate
    ///    does not implement (extension field present, CRC, segment or
    ///    user access field absent, a length indicator other than 2, or
    ///    an unknown type value)
    ///  - [MscError::InvalidCrc] when the signalled CRC does not match
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 9 {
            return Err(MscError::Incomplete);
        }

        let mut header = data;
        let flags = header.read_u8()?;
        if flags & 0x80 != 0 {
            return Err(MscError::UnsupportedFeature("extension field set"));
        }
        if flags & 0x40 == 0 {
            return Err(MscError::UnsupportedFeature("CRC flag not set"));
        }
        if flags & 0x20 == 0 {
            return Err(MscError::UnsupportedFeature("segment field not set"));
        }
        if flags & 0x10 == 0 {
            return Err(MscError::UnsupportedFeature("user access field not set"));
        }
        let datagroup_type = DatagroupType::from_4bits(flags)?;

        let continuity_field = header.read_u8()?;
        let continuity = continuity_field >> 4;
        let repetition = continuity_field & 0x0F;

        // session header: segment field
        let segment_field = header.read_u16::<BigEndian>()?;
        let last = segment_field & 0x8000 != 0;
        let segment_index = segment_field & 0x7FFF;

        // user access field
        let access = header.read_u8()?;
        if access & 0x10 == 0 {
            return Err(MscError::UnsupportedFeature("transport ID flag not set"));
        }
        if access & 0x0F != 2 {
            return Err(MscError::UnsupportedFeature(
                "length indicator different to 2",
            ));
        }
        let transport_id = header.read_u16::<BigEndian>()?;

        // the 13-bit SegmentSize of the segment header which follows
        let size = (header.read_u16::<BigEndian>()? & 0x1FFF) as usize;
        trace!("parsed a type {datagroup_type:?} header declaring a segment of {size:} bytes");

        // the whole frame: header, segment header, payload and CRC
        if data.len() < 9 + size + 2 {
            return Err(MscError::Incomplete);
        }

        let payload = data[7..7 + 2 + size].to_vec();
        let signalled = u16::from_be_bytes([data[9 + size], data[10 + size]]);
        let calculated = calculate_crc(&data[..9 + size]);
        if signalled != calculated {
            return Err(MscError::InvalidCrc {
                calculated,
                signalled,
            });
        }

        let datagroup = Self {
            transport_id,
            datagroup_type,
            data: payload,
            segment_index,
            continuity,
            repetition,
            last,
        };
        debug!("parsed datagroup: {datagroup:?}");

        Ok(datagroup)
    }
}

/// The surface of an MOT object read by the carriage-mode encoders. The
/// object model itself (content types, parameter encoding, transport ID
/// assignment) lives in a collaborating crate.
pub trait MotObject {
    /// The object body bytes.
    fn body(&self) -> &[u8];

    /// The transport ID tying this object's datagroups together.
    fn transport_id(&self) -> u16;

    /// The MOT ContentType and ContentSubType pair, 6 and 9 bits.
    fn content_type(&self) -> (u8, u16);

    /// The header extension parameters, in signalling order.
    fn parameters(&self) -> &[Box<dyn HeaderParameter>];
}

/// A header or directory extension parameter whose encoded form is
/// already known to the MOT collaborator.
pub trait HeaderParameter {
    /// The encoded parameter bytes as they appear in a header extension.
    fn encode(&self) -> Vec<u8>;
}

/// MOT header core: 28-bit BodySize, 13-bit HeaderSize (the 7 core bytes
/// plus the extension), 6-bit ContentType, 9-bit ContentSubType.
fn encode_core_header(
    body_size: usize,
    extension_size: usize,
    content_type: (u8, u16),
) -> Vec<u8> {
    let header_size = extension_size + 7;
    let (content_type, content_subtype) = content_type;
    let word = (body_size as u64 & 0x0FFF_FFFF) << 28
        | (header_size as u64 & 0x1FFF) << 15
        | (u64::from(content_type) & 0x3F) << 9
        | u64::from(content_subtype) & 0x1FF;
    word.to_be_bytes()[1..].to_vec()
}

fn encode_extension(parameters: &[Box<dyn HeaderParameter>]) -> Vec<u8> {
    let mut extension = Vec::new();
    for parameter in parameters.iter() {
        extension.extend_from_slice(&parameter.encode());
    }
    extension
}

/// Emit one datagroup per segment, indexed from zero, with the last
/// segment flagged.
fn append_segments(
    datagroups: &mut Vec<Datagroup>,
    transport_id: u16,
    datagroup_type: DatagroupType,
    segments: Vec<Vec<u8>>,
) -> Result<()> {
    let count = segments.len();
    for (i, segment) in segments.into_iter().enumerate() {
        let index = u16::try_from(i).map_err(|_| {
            MscError::InvalidArgument(format!("segment index {i:} exceeds the 15-bit field"))
        })?;
        datagroups.push(Datagroup::new(
            transport_id,
            datagroup_type,
            segment,
            index,
            (i % 16) as u8,
            0,
            i == count - 1,
        )?);
    }
    Ok(())
}

/// Encode a set of MOT objects into header mode datagroups: for each
/// object, its header segments (type 3) followed by its body segments
/// (type 4), all under the object's transport ID.
///
/// # Errors
///
/// [MscError::InvalidArgument] when the strategy's sizes are out of
/// range or an object segments into more than 32768 pieces.
pub fn encode_headermode<O: MotObject>(
    objects: &[O],
    strategy: &SegmentingStrategy,
) -> Result<Vec<Datagroup>> {
    let mut datagroups = Vec::new();
    debug!("encoding {} MOT objects to header mode datagroups", objects.len());

    for object in objects {
        let body_segments = segment(object.body(), strategy)?;

        let extension = encode_extension(object.parameters());
        let mut header =
            encode_core_header(object.body().len(), extension.len(), object.content_type());
        header.extend_from_slice(&extension);
        let header_segments = segment(&header, strategy)?;

        append_segments(
            &mut datagroups,
            object.transport_id(),
            DatagroupType::Header,
            header_segments,
        )?;
        append_segments(
            &mut datagroups,
            object.transport_id(),
            DatagroupType::Body,
            body_segments,
        )?;
    }

    Ok(datagroups)
}

/// Encode a set of MOT objects into directory mode datagroups: a
/// segmented directory (type 6) under a freshly allocated transport ID,
/// then each object's body segments (type 4) under its own transport ID.
///
/// The directory transport ID is drawn from the process-wide generator;
/// use [encode_directorymode_with] to inject one.
///
/// # Errors
///
/// [MscError::InvalidArgument] when the strategy's sizes are out of
/// range or a stream segments into more than 32768 pieces.
pub fn encode_directorymode<O: MotObject>(
    objects: &[O],
    directory_parameters: &[&dyn HeaderParameter],
    strategy: &SegmentingStrategy,
) -> Result<Vec<Datagroup>> {
    encode_directory_datagroups(
        objects,
        directory_parameters,
        strategy,
        generate_transport_id(None),
    )
}

/// [encode_directorymode] with the directory transport ID drawn from the
/// supplied generator.
pub fn encode_directorymode_with<O: MotObject, G: TransportIdGenerator>(
    objects: &[O],
    directory_parameters: &[&dyn HeaderParameter],
    strategy: &SegmentingStrategy,
    ids: &mut G,
) -> Result<Vec<Datagroup>> {
    encode_directory_datagroups(objects, directory_parameters, strategy, ids.next(None))
}

fn encode_directory_datagroups<O: MotObject>(
    objects: &[O],
    directory_parameters: &[&dyn HeaderParameter],
    strategy: &SegmentingStrategy,
    directory_transport_id: u16,
) -> Result<Vec<Datagroup>> {
    let mut datagroups = Vec::new();
    debug!("encoding {} MOT objects to directory mode datagroups", objects.len());

    // directory entries: each object's transport ID followed by its header
    let mut entries = Vec::new();
    for object in objects {
        let extension = encode_extension(object.parameters());
        entries.extend_from_slice(&object.transport_id().to_be_bytes());
        entries.extend_from_slice(&encode_core_header(
            object.body().len(),
            extension.len(),
            object.content_type(),
        ));
        entries.extend_from_slice(&extension);
    }

    let mut directory_params = Vec::new();
    for parameter in directory_parameters {
        directory_params.extend_from_slice(&parameter.encode());
    }

    // the 13-byte directory header:
    // (0): CompressionFlag, (1): RFU, (2-31): DirectorySize in bytes
    // including this header and the parameter bytes
    let directory_size = 13 + directory_params.len() + entries.len();
    let mut directory = Vec::with_capacity(directory_size);
    directory.extend_from_slice(&(directory_size as u32 & 0x3FFF_FFFF).to_be_bytes());
    // (32-47): NumberOfObjects
    directory.extend_from_slice(&(objects.len() as u16).to_be_bytes());
    // (48-71): DataCarouselPeriod, zero for undefined
    directory.extend_from_slice(&[0, 0, 0]);
    // (72-74): RFU, (75-87): carousel SegmentSize, zero as objects may
    // be segmented at different sizes
    directory.extend_from_slice(&0_u16.to_be_bytes());
    // (88-103): DirectoryExtensionLength
    directory.extend_from_slice(&(directory_params.len() as u16).to_be_bytes());
    directory.extend_from_slice(&directory_params);
    directory.extend_from_slice(&entries);

    let segments = segment(&directory, strategy)?;
    append_segments(
        &mut datagroups,
        directory_transport_id,
        DatagroupType::DirectoryUncompressed,
        segments,
    )?;

    for object in objects {
        let segments = segment(object.body(), strategy)?;
        append_segments(
            &mut datagroups,
            object.transport_id(),
            DatagroupType::Body,
            segments,
        )?;
    }

    Ok(datagroups)
}

/// Decode datagroups lazily from a byte slice.
///
/// A CRC failure is forwarded to the error callback and the decoder
/// either resynchronises by a single byte (the default) or skips the
/// declared frame size. An unsupported header layout is forwarded to the
/// callback and ends the sequence. The sequence also ends when the
/// remaining bytes can no longer hold a frame.
pub fn decode_datagroups(data: &[u8]) -> DatagroupDecoder<'_> {
    DatagroupDecoder {
        data,
        resync: true,
        callback: None,
    }
}

/// Decode datagroups lazily from an I/O byte source, buffering
/// internally until whole frames are available. End-of-stream terminates
/// the sequence; read errors are forwarded to the error callback.
pub fn read_datagroups<'a, R: Read>(reader: R) -> DatagroupReader<'a, R> {
    DatagroupReader {
        reader,
        buffer: Vec::new(),
        eof: false,
        resync: true,
        callback: None,
    }
}

/// Reassemble datagroups from an upstream sequence of packets:
/// accumulate the data fields from a `first` packet through the matching
/// `last` packet, then parse the result as one datagroup. A CRC failure
/// or incomplete series goes to the callback and the sequence continues;
/// an unsupported header layout goes to the callback and ends it.
pub fn reassemble_datagroups<'a, I>(packets: I) -> DatagroupReassembler<'a, I>
where
    I: Iterator<Item = Packet>,
{
    DatagroupReassembler {
        packets,
        address: None,
        buffer: Vec::new(),
        in_series: false,
        done: false,
        callback: None,
    }
}

/// The on-wire size a datagroup header declares, for skipping a bad
/// frame without reparsing it. Callers must have checked `data` holds at
/// least the 9 header bytes.
pub(crate) fn declared_size(data: &[u8]) -> usize {
    9 + (u16::from_be_bytes([data[7], data[8]]) & 0x1FFF) as usize + 2
}

/// Iterator over the datagroups contained in a byte slice.
/// See [decode_datagroups].
pub struct DatagroupDecoder<'a> {
    data: &'a [u8],
    resync: bool,
    callback: Option<ErrorCallback<'a>>,
}

impl<'a> DatagroupDecoder<'a> {
    /// Whether a CRC failure advances the cursor by a single byte (true,
    /// the default) or by the declared frame size (false).
    pub fn resync(mut self, resync: bool) -> Self {
        self.resync = resync;
        self
    }

    /// Install a callback invoked with every reported decode error.
    pub fn on_error(mut self, callback: impl FnMut(&MscError) + 'a) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl Iterator for DatagroupDecoder<'_> {
    type Item = Datagroup;

    fn next(&mut self) -> Option<Datagroup> {
        while !self.data.is_empty() {
            match Datagroup::decode(self.data) {
                Ok(datagroup) => {
                    trace!("moving forward {} bytes", datagroup.size());
                    self.data = &self.data[datagroup.size()..];
                    return Some(datagroup);
                }
                Err(MscError::Incomplete) => return None,
                Err(error @ MscError::InvalidCrc { .. }) => {
                    warn!("CRC failure decoding datagroup, resynchronising: {error:}");
                    if let Some(callback) = self.callback.as_mut() {
                        callback(&error);
                    }
                    let skip = if self.resync {
                        1
                    } else {
                        declared_size(self.data)
                    };
                    self.data = &self.data[skip.min(self.data.len())..];
                }
                Err(error) => {
                    warn!("unrecoverable error decoding datagroup: {error:}");
                    if let Some(callback) = self.callback.as_mut() {
                        callback(&error);
                    }
                    self.data = &[];
                    return None;
                }
            }
        }
        None
    }
}

/// Iterator over the datagroups read from an I/O source.
/// See [read_datagroups].
pub struct DatagroupReader<'a, R: Read> {
    reader: R,
    buffer: Vec<u8>,
    eof: bool,
    resync: bool,
    callback: Option<ErrorCallback<'a>>,
}

impl<'a, R: Read> DatagroupReader<'a, R> {
    /// Whether a CRC failure advances the buffer by a single byte (true,
    /// the default) or by the declared frame size (false).
    pub fn resync(mut self, resync: bool) -> Self {
        self.resync = resync;
        self
    }

    /// Install a callback invoked with every reported decode error.
    pub fn on_error(mut self, callback: impl FnMut(&MscError) + 'a) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Pull one chunk from the source into the accumulator.
    /// Returns false once the source is exhausted.
    fn fill(&mut self) -> bool {
        if self.eof {
            return false;
        }
        let mut chunk = [0_u8; READ_CHUNK];
        match self.reader.read(&mut chunk) {
            Ok(0) => {
                debug!("byte source exhausted with {} bytes buffered", self.buffer.len());
                self.eof = true;
                false
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                trace!("buffered {n:} bytes from the byte source");
                true
            }
            Err(error) => {
                warn!("error whilst reading from the byte source: {error:}");
                if let Some(callback) = self.callback.as_mut() {
                    callback(&MscError::Io(error));
                }
                self.eof = true;
                false
            }
        }
    }
}

impl<R: Read> Iterator for DatagroupReader<'_, R> {
    type Item = Datagroup;

    fn next(&mut self) -> Option<Datagroup> {
        loop {
            match Datagroup::decode(&self.buffer) {
                Ok(datagroup) => {
                    self.buffer.drain(..datagroup.size());
                    return Some(datagroup);
                }
                Err(MscError::Incomplete) => {
                    if !self.fill() {
                        return None;
                    }
                }
                Err(error @ MscError::InvalidCrc { .. }) => {
                    warn!("CRC failure decoding datagroup, resynchronising: {error:}");
                    if let Some(callback) = self.callback.as_mut() {
                        callback(&error);
                    }
                    let skip = if self.resync {
                        1
                    } else {
                        declared_size(&self.buffer)
                    };
                    self.buffer.drain(..skip.min(self.buffer.len()));
                }
                Err(error) => {
                    warn!("unrecoverable error decoding datagroup: {error:}");
                    if let Some(callback) = self.callback.as_mut() {
                        callback(&error);
                    }
                    self.buffer.clear();
                    self.eof = true;
                    return None;
                }
            }
        }
    }
}

/// Iterator reassembling datagroups from an upstream packet sequence.
/// See [reassemble_datagroups].
pub struct DatagroupReassembler<'a, I> {
    packets: I,
    address: Option<u16>,
    buffer: Vec<u8>,
    in_series: bool,
    done: bool,
    callback: Option<ErrorCallback<'a>>,
}

impl<'a, I> DatagroupReassembler<'a, I> {
    /// Only reassemble packets carrying this address; others are passed
    /// over. By default every packet contributes.
    pub fn address(mut self, address: u16) -> Self {
        self.address = Some(address);
        self
    }

    /// Install a callback invoked with every per-datagroup decode error.
    pub fn on_error(mut self, callback: impl FnMut(&MscError) + 'a) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl<I> Iterator for DatagroupReassembler<'_, I>
where
    I: Iterator<Item = Packet>,
{
    type Item = Datagroup;

    fn next(&mut self) -> Option<Datagroup> {
        if self.done {
            return None;
        }
        loop {
            let packet = self.packets.next()?;
            if let Some(address) = self.address {
                if packet.address() != address {
                    continue;
                }
            }
            if !self.in_series {
                if packet.is_first() {
                    self.in_series = true;
                } else {
                    continue;
                }
            }

            self.buffer.extend_from_slice(packet.data());

            if packet.is_last() {
                trace!("series complete, buffer now {} bytes", self.buffer.len());
                let result = Datagroup::decode(&self.buffer);
                self.buffer.clear();
                self.in_series = false;
                match result {
                    Ok(datagroup) => return Some(datagroup),
                    Err(error @ (MscError::InvalidCrc { .. } | MscError::Incomplete)) => {
                        warn!("error reassembling datagroup: {error:}");
                        if let Some(callback) = self.callback.as_mut() {
                            callback(&error);
                        }
                    }
                    Err(error) => {
                        warn!("unrecoverable error reassembling datagroup: {error:}");
                        if let Some(callback) = self.callback.as_mut() {
                            callback(&error);
                        }
                        self.done = true;
                        return None;
                    }
                }
            }
        }
    }
}
