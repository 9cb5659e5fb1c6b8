#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]
use crc::{Crc, CRC_16_GENIBUS};

pub mod datagroups;
mod error;
pub mod packets;
pub mod segmentation;
pub mod transport_id;

#[cfg(any(feature = "async-codec", feature = "tokio-codec"))]
#[cfg_attr(
    docsrs,
    doc(cfg(any(feature = "async-codec", feature = "tokio-codec")))
)]
/// This module provides implementations
/// to provide Sink/Stream support for parsing [Datagroup](datagroups::Datagroup)s
/// and [Packet](packets::Packet)s from network data.
///
/// It provides implementations of both the asynchronous-codec and the tokio-util::codec
/// traits for compatibility.
pub mod codec;

pub use error::{MscError, Result};

#[doc(inline)]
/// A re-export of the [crc] crate.
pub use crc;

/// The 16-bit CRC protecting both framing layers: the CCITT polynomial
/// 0x1021, all-ones initial state, inverted output (EN 300 401, 5.3.3.4).
const CRC_MSC: Crc<u16> = Crc::<u16>::new(&CRC_16_GENIBUS);

/// Calculate the CRC word appended to a datagroup or packet.
///
/// The check value over the ASCII bytes `123456789` is `0xD64E`.
pub fn calculate_crc(data: &[u8]) -> u16 {
    CRC_MSC.checksum(data)
}

#[cfg(test)]
mod test {
    use super::*;

    use rstest::rstest;

    #[rstest]
    // classic check vector, http://reveng.sourceforge.net/crc-catalogue/16.htm
    #[case(b"123456789".to_vec(), 0xD64E)]
    // a header-mode datagroup without its trailing CRC word
    #[case(
        hex("730080001230390014000001000a0401cc0b40546573744f626a656374"),
        0x9D93
    )]
    fn crc_checksum(#[case] data: Vec<u8>, #[case] expected: u16) {
        assert_eq!(calculate_crc(&data), expected)
    }

    pub(crate) fn hex(s: &str) -> Vec<u8> {
        assert!(s.len() % 2 == 0, "hex strings must have an even length");
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).expect("invalid hex digit"))
            .collect()
    }
}
