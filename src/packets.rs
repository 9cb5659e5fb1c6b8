//! MSC packet framing as defined in EN 300 401, 5.3.2: fixed-size
//! packets of 24, 48, 72 or 96 bytes carrying a 10-bit address, a 2-bit
//! continuity index and a 16-bit CRC.

use std::collections::HashMap;
use std::io::Read;

use log::{debug, trace, warn};

use crate::datagroups::{Datagroup, ErrorCallback};
use crate::{calculate_crc, MscError, Result};

/// Bytes pulled from an I/O source per refill of a streaming decoder.
pub(crate) const READ_CHUNK: usize = 4096;

/// The total on-wire length of an MSC packet.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketSize {
    Size24 = 24,
    Size48 = 48,
    Size72 = 72,
    Size96 = 96,
}

impl PacketSize {
    /// Total on-wire length in bytes.
    pub fn value(self) -> usize {
        self as usize
    }

    /// Capacity of the data field: the 3-byte header and 2-byte CRC are
    /// always present.
    pub fn capacity(self) -> usize {
        self.value() - 5
    }

    /// The 2-bit PacketLength code signalled on the wire.
    fn code(self) -> u8 {
        (self.value() / 24 - 1) as u8
    }

    fn from_2bits(input: u8) -> Self {
        match input & 0b11 {
            0b00 => Self::Size24,
            0b01 => Self::Size48,
            0b10 => Self::Size72,
            0b11 => Self::Size96,
            _ => unreachable!(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// One fixed-size MSC packet, the outer framing unit carrying a chunk of
/// a datagroup's on-wire bytes.
pub struct Packet {
    size: PacketSize,
    address: u16,
    data: Vec<u8>,
    first: bool,
    last: bool,
    index: u8,
}

impl Packet {
    /// Initialize a new packet.
    ///
    /// # Errors
    ///
    /// [MscError::InvalidArgument] under the following circumstances
    ///  - `address` outside 1..=1023
    ///  - `data` longer than the packet's data field
    ///  - `index` > 3
    pub fn new(
        size: PacketSize,
        address: u16,
        data: Vec<u8>,
        first: bool,
        last: bool,
        index: u8,
    ) -> Result<Self> {
        if !(1..=1023).contains(&address) {
            return Err(MscError::InvalidArgument(format!(
                "packet address must be within 1..=1023 but found {address:}"
            )));
        }
        if data.len() > size.capacity() {
            return Err(MscError::InvalidArgument(format!(
                "packet data of {} bytes exceeds the {} byte data field of a {} byte packet",
                data.len(),
                size.capacity(),
                size.value()
            )));
        }
        if index > 3 {
            return Err(MscError::InvalidArgument(format!(
                "continuity index must be <=3 but found {index:}"
            )));
        }

        Ok(Self {
            size,
            address,
            data,
            first,
            last,
            index,
        })
    }

    /// The total on-wire size of this packet.
    pub fn size(&self) -> PacketSize {
        self.size
    }

    /// The 10-bit packet address.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Borrow the useful data carried by this packet.
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Whether this packet begins a datagroup series.
    pub fn is_first(&self) -> bool {
        self.first
    }

    /// Whether this packet ends a datagroup series.
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// The 2-bit continuity index.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Render the packet to its byte array representation.
    /// Assumes Big Endian byte order.
    pub fn encode(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(self.size.value());

        let header = u16::from(self.size.code()) << 14
            | u16::from(self.index & 0b11) << 12
            | (self.first as u16) << 11
            | (self.last as u16) << 10
            | (self.address & 0x3FF);
        message.extend_from_slice(&header.to_be_bytes());

        // command flag 0 (data), then the 7-bit useful data length
        message.push(self.data.len() as u8 & 0x7F);
        message.extend_from_slice(&self.data);

        // zero padding up to the CRC
        message.resize(self.size.value() - 2, 0);
        message.extend_from_slice(&calculate_crc(&message).to_be_bytes());

        message
    }

    /// Parse a packet from a byte array.
    /// Assumes Big Endian byte order.
    ///
    /// # Errors
    ///
    ///  - [MscError::Incomplete] when the buffer ends inside the packet
    ///  - [MscError::InvalidCrc] when the signalled CRC does not match
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(MscError::Incomplete);
        }

        let header = u16::from_be_bytes([data[0], data[1]]);
        let size = PacketSize::from_2bits((header >> 14) as u8);
        if data.len() < size.value() {
            return Err(MscError::Incomplete);
        }

        let index = ((header >> 12) & 0b11) as u8;
        let first = (header >> 11) & 1 == 1;
        let last = (header >> 10) & 1 == 1;
        let address = header & 0x3FF;

        let signalled = u16::from_be_bytes([data[size.value() - 2], data[size.value() - 1]]);
        let calculated = calculate_crc(&data[..size.value() - 2]);
        if signalled != calculated {
            return Err(MscError::InvalidCrc {
                calculated,
                signalled,
            });
        }
        trace!("the signalled CRC {signalled:#06X} matches the calculated CRC");

        // a foreign encoder may declare more useful data than the field holds
        let data_length = (data[2] & 0x7F) as usize;
        let end = (3 + data_length).min(size.value() - 2);
        let payload = data[3..end].to_vec();

        let packet = Self {
            size,
            address,
            data: payload,
            first,
            last,
            index,
        };
        debug!("parsed packet: {packet:?}");

        Ok(packet)
    }
}

/// Encode a sequence of datagroups into fixed-size packets sharing one
/// address, starting the 2-bit continuity count at zero.
///
/// # Errors
///
/// [MscError::InvalidArgument] if `address` is outside 1..=1023.
pub fn encode_packets(
    datagroups: &[Datagroup],
    address: u16,
    size: PacketSize,
) -> Result<Vec<Packet>> {
    encode_packets_with_continuity(datagroups, address, size, &mut HashMap::new())
}

/// Encode a sequence of datagroups into fixed-size packets, carrying the
/// per-address continuity count in `continuity` so that a subsequent call
/// with the same map continues where the previous one left off.
///
/// # Errors
///
/// [MscError::InvalidArgument] if `address` is outside 1..=1023.
pub fn encode_packets_with_continuity(
    datagroups: &[Datagroup],
    address: u16,
    size: PacketSize,
    continuity: &mut HashMap<u16, u8>,
) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();

    for datagroup in datagroups {
        let data = datagroup.encode();
        let chunk_size = size.capacity();
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let first = i == 0;
            let last = (i + 1) * chunk_size >= data.len();
            let index = next_continuity_index(continuity, address);
            packets.push(Packet::new(
                size,
                address,
                chunk.to_vec(),
                first,
                last,
                index,
            )?);
        }
    }

    debug!(
        "encoded {} datagroups into {} packets of {} bytes",
        datagroups.len(),
        packets.len(),
        size.value()
    );
    Ok(packets)
}

fn next_continuity_index(continuity: &mut HashMap<u16, u8>, address: u16) -> u8 {
    let index = match continuity.get(&address) {
        Some(previous) => (previous + 1) & 0b11,
        None => 0,
    };
    continuity.insert(address, index);
    index
}

/// Decode packets lazily from a byte slice.
///
/// A CRC failure is forwarded to the error callback and the decoder
/// either resynchronises by a single byte (the default) or skips the
/// declared packet size. The sequence ends when the remaining bytes can
/// no longer hold a packet.
pub fn decode_packets(data: &[u8]) -> PacketDecoder<'_> {
    PacketDecoder {
        data,
        resync: true,
        callback: None,
    }
}

/// Decode packets lazily from an I/O byte source, buffering internally
/// until whole packets are available. End-of-stream terminates the
/// sequence; read errors are forwarded to the error callback.
pub fn read_packets<'a, R: Read>(reader: R) -> PacketReader<'a, R> {
    PacketReader {
        reader,
        buffer: Vec::new(),
        eof: false,
        resync: true,
        callback: None,
    }
}

/// Iterator over the packets contained in a byte slice.
/// See [decode_packets].
pub struct PacketDecoder<'a> {
    data: &'a [u8],
    resync: bool,
    callback: Option<ErrorCallback<'a>>,
}

impl<'a> PacketDecoder<'a> {
    /// Whether a CRC failure advances the cursor by a single byte (true,
    /// the default) or by the declared packet size (false).
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

impl Iterator for PacketDecoder<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        while !self.data.is_empty() {
            match Packet::decode(self.data) {
                Ok(packet) => {
                    trace!("moving forward {} bytes", packet.size().value());
                    self.data = &self.data[packet.size().value()..];
                    return Some(packet);
                }
                Err(MscError::Incomplete) => return None,
                Err(error @ MscError::InvalidCrc { .. }) => {
                    warn!("CRC failure decoding packet, resynchronising: {error:}");
                    if let Some(callback) = self.callback.as_mut() {
                        callback(&error);
                    }
                    let skip = if self.resync {
                        1
                    } else {
                        PacketSize::from_2bits(self.data[0] >> 6).value()
                    };
                    self.data = &self.data[skip.min(self.data.len())..];
                }
                Err(error) => {
                    warn!("unrecoverable error decoding packet: {error:}");
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

/// Iterator over the packets read from an I/O source.
/// See [read_packets].
pub struct PacketReader<'a, R: Read> {
    reader: R,
    buffer: Vec<u8>,
    eof: bool,
    resync: bool,
    callback: Option<ErrorCallback<'a>>,
}

impl<'a, R: Read> PacketReader<'a, R> {
    /// Whether a CRC failure advances the buffer by a single byte (true,
    /// the default) or by the declared packet size (false).
    pub fn resync(mut self, resync: bool) -> Self {
        self.resync = resync;
        self
    }

    /// Install a callback invoked with every reported decode error.
    pub fn on_error(mut self, callback: impl FnMut(&MscError) + 'a) -> PacketReader<'a, R> {
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

impl<R: Read> Iterator for PacketReader<'_, R> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        loop {
            match Packet::decode(&self.buffer) {
                Ok(packet) => {
                    self.buffer.drain(..packet.size().value());
                    return Some(packet);
                }
                Err(MscError::Incomplete) => {
                    if !self.fill() {
                        return None;
                    }
                }
                Err(error @ MscError::InvalidCrc { .. }) => {
                    warn!("CRC failure decoding packet, resynchronising: {error:}");
                    if let Some(callback) = self.callback.as_mut() {
                        callback(&error);
                    }
                    let skip = if self.resync {
                        1
                    } else {
                        PacketSize::from_2bits(self.buffer[0] >> 6).value()
                    };
                    self.buffer.drain(..skip.min(self.buffer.len()));
                }
                Err(error) => {
                    warn!("unrecoverable error decoding packet: {error:}");
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
