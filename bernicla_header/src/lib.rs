//!
//! The fixed 24-byte frame header shared by the Cyphal/UDP and Cyphal/serial
//! transports
//!
//! Layout (little-endian except the trailing CRC):
//!
//! ```text
//! offset  field
//! 0       version (currently 1)
//! 1       priority
//! 2       source node ID       (0xffff = anonymous)
//! 4       destination node ID  (0xffff = broadcast)
//! 6       data specifier word
//! 8       transfer ID (64 bits)
//! 16      frame index, bit 31 = end of transfer
//! 20      user data (transmitted as zero)
//! 22      CRC-16/CCITT-FALSE over the first 22 bytes, big-endian
//! ```
//!
//! The data specifier word carries a subject ID directly; bit 15 marks a
//! service, in which case bit 14 distinguishes requests (1) from responses
//! (0) and the low 9 bits carry the service ID.

use core::convert::TryFrom;

use crc_any::CRCu16;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use bernicla_core::transfer::DataSpecifier;
use bernicla_core::{NodeId, Priority, ServiceId, SubjectId, TransferId};

/// Encoded header length in bytes
pub const SIZE: usize = 24;

/// The current header format version
pub const VERSION: u8 = 1;

/// The node-ID word that denotes "no node": anonymous sources, broadcast
/// destinations
const NODE_ID_NONE: u16 = 0xffff;

const SERVICE_FLAG: u16 = 1 << 15;
const REQUEST_FLAG: u16 = 1 << 14;
const END_OF_TRANSFER_FLAG: u32 = 1 << 31;

/// The wire form, kept private behind [`FrameHeader`]
#[derive(FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct RawHeader {
    version: u8,
    priority: u8,
    source: U16<LittleEndian>,
    destination: U16<LittleEndian>,
    data_specifier: U16<LittleEndian>,
    transfer_id: U64<LittleEndian>,
    frame_index_eot: U32<LittleEndian>,
    user_data: U16<LittleEndian>,
    /// Big-endian CRC of the preceding 22 bytes
    crc: [u8; 2],
}

/// A parsed (or to-be-encoded) frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub priority: Priority,
    pub source: Option<NodeId>,
    pub destination: Option<NodeId>,
    pub data_specifier: DataSpecifier,
    pub transfer_id: TransferId,
    /// Zero-based index of this frame within its transfer
    pub frame_index: u32,
    pub end_of_transfer: bool,
}

/// Why a header could not be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Fewer than [`SIZE`] bytes available
    TooShort,
    /// The version byte does not match [`VERSION`]; the legacy layout is
    /// deliberately not auto-detected
    UnsupportedVersion(u8),
    /// The header CRC does not match
    BadCrc,
    /// A field carries a value outside its range
    Malformed,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; SIZE] {
        let raw = RawHeader {
            version: VERSION,
            priority: self.priority.to_u8(),
            source: U16::new(self.source.map(u16::from).unwrap_or(NODE_ID_NONE)),
            destination: U16::new(self.destination.map(u16::from).unwrap_or(NODE_ID_NONE)),
            data_specifier: U16::new(encode_data_specifier(&self.data_specifier)),
            transfer_id: U64::new(self.transfer_id.to_u64()),
            frame_index_eot: U32::new(
                (self.frame_index & !END_OF_TRANSFER_FLAG)
                    | if self.end_of_transfer {
                        END_OF_TRANSFER_FLAG
                    } else {
                        0
                    },
            ),
            user_data: U16::new(0),
            crc: [0; 2],
        };
        let mut bytes = [0u8; SIZE];
        bytes.copy_from_slice(raw.as_bytes());
        let crc = header_crc(&bytes[..SIZE - 2]);
        bytes[SIZE - 2] = (crc >> 8) as u8;
        bytes[SIZE - 1] = crc as u8;
        bytes
    }

    /// Parses and validates a header from the front of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<FrameHeader, HeaderError> {
        let (raw, _) = LayoutVerified::<_, RawHeader>::new_unaligned_from_prefix(bytes)
            .ok_or(HeaderError::TooShort)?;
        if raw.version != VERSION {
            return Err(HeaderError::UnsupportedVersion(raw.version));
        }
        let crc = header_crc(&bytes[..SIZE - 2]);
        if [(crc >> 8) as u8, crc as u8] != raw.crc {
            return Err(HeaderError::BadCrc);
        }
        let priority = Priority::try_from(raw.priority).map_err(|_| HeaderError::Malformed)?;
        let data_specifier =
            decode_data_specifier(raw.data_specifier.get()).ok_or(HeaderError::Malformed)?;
        let frame_index_eot = raw.frame_index_eot.get();
        Ok(FrameHeader {
            priority,
            source: decode_node_id(raw.source.get()),
            destination: decode_node_id(raw.destination.get()),
            data_specifier,
            transfer_id: TransferId::new(raw.transfer_id.get()),
            frame_index: frame_index_eot & !END_OF_TRANSFER_FLAG,
            end_of_transfer: frame_index_eot & END_OF_TRANSFER_FLAG != 0,
        })
    }

    /// Whether this is the only frame of its transfer
    pub fn is_single_frame(&self) -> bool {
        self.frame_index == 0 && self.end_of_transfer
    }
}

fn decode_node_id(word: u16) -> Option<NodeId> {
    if word == NODE_ID_NONE {
        None
    } else {
        Some(NodeId::new(word))
    }
}

fn encode_data_specifier(spec: &DataSpecifier) -> u16 {
    match spec {
        DataSpecifier::Subject(subject) => u16::from(*subject),
        DataSpecifier::ServiceRequest(service) => {
            SERVICE_FLAG | REQUEST_FLAG | u16::from(*service)
        }
        DataSpecifier::ServiceResponse(service) => SERVICE_FLAG | u16::from(*service),
    }
}

fn decode_data_specifier(word: u16) -> Option<DataSpecifier> {
    if word & SERVICE_FLAG == 0 {
        SubjectId::try_from(word).ok().map(DataSpecifier::Subject)
    } else {
        let service = ServiceId::try_from(word & 0x1ff).ok()?;
        if word & REQUEST_FLAG != 0 {
            Some(DataSpecifier::ServiceRequest(service))
        } else {
            Some(DataSpecifier::ServiceResponse(service))
        }
    }
}

fn header_crc(bytes: &[u8]) -> u16 {
    let mut crc = CRCu16::crc16ccitt_false();
    crc.digest(bytes);
    crc.get_crc()
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> FrameHeader {
        FrameHeader {
            priority: Priority::Nominal,
            source: Some(NodeId::new(42)),
            destination: None,
            data_specifier: DataSpecifier::Subject(SubjectId::try_from(1234).unwrap()),
            transfer_id: TransferId::new(5),
            frame_index: 0,
            end_of_transfer: true,
        }
    }

    #[test]
    fn round_trip() {
        let header = sample();
        let bytes = header.encode();
        assert_eq!(FrameHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn service_round_trip() {
        let header = FrameHeader {
            priority: Priority::High,
            source: Some(NodeId::new(111)),
            destination: Some(NodeId::new(42)),
            data_specifier: DataSpecifier::ServiceRequest(ServiceId::try_from(123).unwrap()),
            transfer_id: TransferId::new(u64::MAX - 1),
            frame_index: 3,
            end_of_transfer: false,
        };
        let bytes = header.encode();
        assert_eq!(FrameHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn anonymous_source_encodes_sentinel() {
        let mut header = sample();
        header.source = None;
        let bytes = header.encode();
        assert_eq!(bytes[2], 0xff);
        assert_eq!(bytes[3], 0xff);
        assert_eq!(FrameHeader::parse(&bytes).unwrap().source, None);
    }

    #[test]
    fn corrupt_crc_rejected() {
        let mut bytes = sample().encode();
        bytes[6] ^= 0x01;
        assert_eq!(FrameHeader::parse(&bytes), Err(HeaderError::BadCrc));
    }

    #[test]
    fn legacy_version_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = 0;
        assert_eq!(
            FrameHeader::parse(&bytes),
            Err(HeaderError::UnsupportedVersion(0))
        );
    }

    #[test]
    fn short_input_rejected() {
        assert_eq!(
            FrameHeader::parse(&[0u8; SIZE - 1]),
            Err(HeaderError::TooShort)
        );
    }
}
