// src/protocols/cip/message.rs - CIP service requests and replies
use super::epath;
use super::status::{status_message, EMBEDDED_SERVICE_ERROR, UNKNOWN_REPLY};
use crate::error::{PlcError, Result};
use crate::protocols::ControllerIdentity;
use crate::tag::PendingWrite;
use crate::value::{DataType, Value};
use bytes::Bytes;
use std::fmt;
use std::ops::Range;

// ============================================================================
// SERVICE CODES
// ============================================================================

pub const GET_ATTRIBUTE_ALL: u8 = 0x01;
pub const MULTIPLE_SERVICE_PACKET: u8 = 0x0A;
pub const READ_TAG: u8 = 0x4C;
pub const WRITE_TAG: u8 = 0x4D;
pub const READ_MODIFY_WRITE_TAG: u8 = 0x4E;
pub const UNCONNECTED_SEND: u8 = 0x52;

/// Bit set on the service code of every reply
pub const REPLY_FLAG: u8 = 0x80;

/// Accumulated request size above which a batch is split
pub const MULTI_SERVICE_THRESHOLD: usize = 300;

const IDENTITY_CLASS: u8 = 0x01;
const MESSAGE_ROUTER_CLASS: u8 = 0x02;
const CONNECTION_MANAGER_CLASS: u8 = 0x06;

/// Priority/time tick and timeout ticks of the Unconnected Send wrapper
const TIME_TICK: u8 = 0x0A;
const TIMEOUT_TICKS: u8 = 0x05;

/// Kind of reply a pending request waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    RegisterSession,
    GetAttributeAll,
    ReadTag,
    WriteTag,
    ReadModifyWrite,
    MultipleService,
    UnconnectedSend,
    Other(u8),
}

impl ResponseKind {
    pub fn from_service(service: u8) -> Self {
        match service & !REPLY_FLAG {
            GET_ATTRIBUTE_ALL => ResponseKind::GetAttributeAll,
            READ_TAG => ResponseKind::ReadTag,
            WRITE_TAG => ResponseKind::WriteTag,
            READ_MODIFY_WRITE_TAG => ResponseKind::ReadModifyWrite,
            MULTIPLE_SERVICE_PACKET => ResponseKind::MultipleService,
            UNCONNECTED_SEND => ResponseKind::UnconnectedSend,
            other => ResponseKind::Other(other),
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseKind::RegisterSession => f.write_str("Register Session"),
            ResponseKind::GetAttributeAll => f.write_str("Get Attribute All"),
            ResponseKind::ReadTag => f.write_str("Read Tag"),
            ResponseKind::WriteTag => f.write_str("Write Tag"),
            ResponseKind::ReadModifyWrite => f.write_str("Read Modify Write Tag"),
            ResponseKind::MultipleService => f.write_str("Multiple Service Packet"),
            ResponseKind::UnconnectedSend => f.write_str("Unconnected Send"),
            ResponseKind::Other(code) => write!(f, "service 0x{:02X}", code),
        }
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

/// Message router request: service, path size in words, path, data
pub fn request(service: u8, path: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + path.len() + data.len());
    out.push(service);
    out.push((path.len() / 2) as u8);
    out.extend_from_slice(path);
    out.extend_from_slice(data);
    out
}

/// Read one element of a tag
pub fn read_tag(path: &[u8]) -> Vec<u8> {
    request(READ_TAG, path, &1u16.to_le_bytes())
}

/// Atomic write of one element
pub fn write_tag(path: &[u8], data_type: DataType, value: &Value) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + data_type.size());
    data.extend_from_slice(&data_type.code().to_le_bytes());
    data.extend_from_slice(&1u16.to_le_bytes());
    data.extend(data_type.encode(value));
    request(WRITE_TAG, path, &data)
}

/// Masked write: the controller computes `(old | or) & and`
pub fn read_modify_write(path: &[u8], or_mask: &[u8], and_mask: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 + or_mask.len() * 2);
    data.extend_from_slice(&(or_mask.len() as u16).to_le_bytes());
    data.extend_from_slice(or_mask);
    data.extend_from_slice(and_mask);
    request(READ_MODIFY_WRITE_TAG, path, &data)
}

/// Request performing a staged write: atomic for whole values, masked for bits
pub fn staged_write(path: &[u8], data_type: DataType, pending: &PendingWrite) -> (ResponseKind, Vec<u8>) {
    match pending.bit {
        None => (ResponseKind::WriteTag, write_tag(path, data_type, &pending.value)),
        Some(bit) => {
            let (or_mask, and_mask) = data_type.bit_masks(bit, pending.value.as_int() != 0);
            (
                ResponseKind::ReadModifyWrite,
                read_modify_write(path, &or_mask, &and_mask),
            )
        }
    }
}

/// Bundle several requests into one Multiple Service Packet.
///
/// Offsets are relative to the start of the service count field.
pub fn multiple_service(requests: &[Vec<u8>]) -> Vec<u8> {
    let count = requests.len();
    let mut data = Vec::new();
    data.extend_from_slice(&(count as u16).to_le_bytes());
    let mut offset = 2 + 2 * count;
    for req in requests {
        data.extend_from_slice(&(offset as u16).to_le_bytes());
        offset += req.len();
    }
    for req in requests {
        data.extend_from_slice(req);
    }
    request(
        MULTIPLE_SERVICE_PACKET,
        &epath::logical(MESSAGE_ROUTER_CLASS, 0x01),
        &data,
    )
}

/// Get Attribute All on the Identity object instance 1
pub fn identity() -> Vec<u8> {
    request(GET_ATTRIBUTE_ALL, &epath::logical(IDENTITY_CLASS, 0x01), &[])
}

/// Wrap a request in an Unconnected Send to the Connection Manager
pub fn unconnected_send(message: &[u8], route: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(message.len() + route.len() + 8);
    data.push(TIME_TICK);
    data.push(TIMEOUT_TICKS);
    data.extend_from_slice(&(message.len() as u16).to_le_bytes());
    data.extend_from_slice(message);
    if message.len() % 2 == 1 {
        data.push(0x00);
    }
    data.push((route.len() / 2) as u8);
    data.push(0x00);
    data.extend_from_slice(route);
    request(
        UNCONNECTED_SEND,
        &epath::logical(CONNECTION_MANAGER_CLASS, 0x01),
        &data,
    )
}

/// Split requests into Multiple Service chunks.
///
/// Sizes accumulate until the running total passes the threshold; the request
/// that overflowed starts the next chunk. A single oversized request still
/// gets a chunk of its own.
pub fn chunk_requests(requests: &[Vec<u8>], threshold: usize) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut total = 0;
    for (i, req) in requests.iter().enumerate() {
        if total + req.len() > threshold && i > start {
            chunks.push(start..i);
            start = i;
            total = 0;
        }
        total += req.len();
    }
    if start < requests.len() {
        chunks.push(start..requests.len());
    }
    chunks
}

// ============================================================================
// REPLIES
// ============================================================================

/// Parsed message router reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub service: u8,
    pub status: u8,
    pub extended: Vec<u16>,
    pub data: Bytes,
    /// Sub-replies of a Multiple Service Packet, in request order
    pub nested: Vec<Reply>,
}

impl Reply {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(PlcError::Protocol {
                status: UNKNOWN_REPLY,
                extended: Vec::new(),
                message: format!("Reply of {} bytes is too short", buf.len()),
            });
        }
        let service = buf[0];
        let status = buf[2];
        let ext_words = usize::from(buf[3]);
        let data_start = 4 + ext_words * 2;
        if buf.len() < data_start {
            return Err(PlcError::Protocol {
                status: UNKNOWN_REPLY,
                extended: Vec::new(),
                message: "Truncated extended status".into(),
            });
        }
        let extended = buf[4..data_start]
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();
        let data = Bytes::copy_from_slice(&buf[data_start..]);

        let nested = if service & !REPLY_FLAG == MULTIPLE_SERVICE_PACKET
            && (status == 0 || status == EMBEDDED_SERVICE_ERROR)
        {
            parse_nested(&data)
        } else {
            Vec::new()
        };

        Ok(Self {
            service,
            status,
            extended,
            data,
            nested,
        })
    }

    /// Reply standing in for a sub-reply that could not be parsed
    pub fn unknown() -> Self {
        Self {
            service: 0,
            status: UNKNOWN_REPLY,
            extended: Vec::new(),
            data: Bytes::new(),
            nested: Vec::new(),
        }
    }

    pub fn kind(&self) -> ResponseKind {
        ResponseKind::from_service(self.service)
    }

    /// Error carried by a nonzero general status
    pub fn error(&self) -> Option<PlcError> {
        if self.status == 0 {
            return None;
        }
        Some(PlcError::Protocol {
            status: self.status,
            extended: self.extended.clone(),
            message: status_message(self.status),
        })
    }

    /// Fail on a nonzero status
    pub fn check(&self) -> Result<()> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Decode the value carried by a Read Tag reply
    pub fn read_value(&self) -> Result<(DataType, Value)> {
        self.check()?;
        if self.data.len() < 2 {
            return Err(PlcError::Validation("Read reply carries no type".into()));
        }
        let code = u16::from_le_bytes([self.data[0], self.data[1]]);
        let data_type = DataType::from_code(code).ok_or_else(|| {
            PlcError::Validation(format!("Unsupported data type 0x{:04X}", code))
        })?;
        let value = data_type.decode(&self.data[2..])?;
        Ok((data_type, value))
    }
}

fn parse_nested(data: &[u8]) -> Vec<Reply> {
    if data.len() < 2 {
        return Vec::new();
    }
    let count = usize::from(u16::from_le_bytes([data[0], data[1]]));
    let table_end = 2 + count * 2;
    if data.len() < table_end {
        return vec![Reply::unknown(); count];
    }
    let offsets: Vec<usize> = data[2..table_end]
        .chunks_exact(2)
        .map(|w| usize::from(u16::from_le_bytes([w[0], w[1]])))
        .collect();

    offsets
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = offsets.get(i + 1).copied().unwrap_or(data.len());
            data.get(start..end)
                .and_then(|slice| Reply::parse(slice).ok())
                .unwrap_or_else(Reply::unknown)
        })
        .collect()
}

/// Decode a Get Attribute All reply of the Identity object
pub fn parse_identity(data: &[u8]) -> Result<ControllerIdentity> {
    if data.len() < 15 {
        return Err(PlcError::Validation(format!(
            "Identity reply of {} bytes is too short",
            data.len()
        )));
    }
    let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
    let name_len = usize::from(data[14]);
    let name = data
        .get(15..15 + name_len)
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .unwrap_or_default();

    Ok(ControllerIdentity {
        vendor: u16_at(0),
        device_type: u16_at(2),
        product_code: u16_at(4),
        version: format!("{}.{}", data[6], data[7]),
        serial_number: u32::from_le_bytes([data[10], data[11], data[12], data[13]]),
        name,
        ..Default::default()
    }
    .with_status(u16_at(8)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(service: u8, status: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![service | REPLY_FLAG, 0, status, 0];
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_read_request_layout() {
        let path = epath::symbolic("ab");
        assert_eq!(read_tag(&path), vec![0x4C, 2, 0x91, 2, b'a', b'b', 1, 0]);
    }

    #[test]
    fn test_multiple_service_offsets() {
        let a = vec![0x4C, 0x00];
        let b = vec![0x4C, 0x00, 0x01, 0x00];
        let msg = multiple_service(&[a, b]);
        // service, path size, 4-byte router path
        assert_eq!(&msg[..6], &[0x0A, 2, 0x20, 0x02, 0x24, 0x01]);
        let data = &msg[6..];
        assert_eq!(&data[..6], &[2, 0, 6, 0, 8, 0]);
        assert_eq!(&data[6..8], &[0x4C, 0x00]);
    }

    #[test]
    fn test_unconnected_send_pads_odd_message() {
        let msg = unconnected_send(&[1, 2, 3], &epath::backplane(2));
        let data = &msg[6..];
        assert_eq!(&data[..4], &[TIME_TICK, TIMEOUT_TICKS, 3, 0]);
        assert_eq!(&data[4..8], &[1, 2, 3, 0]);
        assert_eq!(&data[8..], &[1, 0, 0x01, 2]);
    }

    #[test]
    fn test_staged_bit_write_uses_masks() {
        let pending = PendingWrite {
            value: Value::Int(1),
            bit: Some(3),
        };
        let (kind, msg) = staged_write(&epath::symbolic("ab"), DataType::Int, &pending);
        assert_eq!(kind, ResponseKind::ReadModifyWrite);
        assert_eq!(&msg[6..], &[2, 0, 0x08, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_chunking_moves_overflow_to_next_chunk() {
        let requests = vec![vec![0u8; 120], vec![0u8; 120], vec![0u8; 120], vec![0u8; 40]];
        assert_eq!(chunk_requests(&requests, 300), vec![0..2, 2..4]);

        let oversized = vec![vec![0u8; 400], vec![0u8; 10]];
        assert_eq!(chunk_requests(&oversized, 300), vec![0..1, 1..2]);
        assert!(chunk_requests(&[], 300).is_empty());
    }

    #[test]
    fn test_read_reply_value() {
        let raw = reply(READ_TAG, 0, &[0xC4, 0x00, 0x05, 0x0D, 0x00, 0x00]);
        let parsed = Reply::parse(&raw).unwrap();
        assert_eq!(parsed.kind(), ResponseKind::ReadTag);
        assert_eq!(parsed.read_value().unwrap(), (DataType::Dint, Value::Int(3333)));
    }

    #[test]
    fn test_error_status_and_extended() {
        let raw = vec![0xCC, 0, 0x05, 1, 0x00, 0x80];
        let parsed = Reply::parse(&raw).unwrap();
        match parsed.error() {
            Some(PlcError::Protocol { status, extended, message }) => {
                assert_eq!(status, 0x05);
                assert_eq!(extended, vec![0x8000]);
                assert_eq!(message, "Path destination unknown");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nested_replies_with_garbage() {
        let first = reply(WRITE_TAG, 0, &[]);
        let second = vec![0xCE]; // truncated
        let mut data = vec![2, 0];
        data.extend_from_slice(&6u16.to_le_bytes());
        data.extend_from_slice(&(6 + first.len() as u16).to_le_bytes());
        data.extend_from_slice(&first);
        data.extend_from_slice(&second);

        let parsed = Reply::parse(&reply(MULTIPLE_SERVICE_PACKET, EMBEDDED_SERVICE_ERROR, &data)).unwrap();
        assert_eq!(parsed.nested.len(), 2);
        assert_eq!(parsed.nested[0].kind(), ResponseKind::WriteTag);
        assert_eq!(parsed.nested[0].status, 0);
        assert_eq!(parsed.nested[1].status, UNKNOWN_REPLY);
        assert_eq!(
            parsed.nested[1].error().unwrap().to_string(),
            "Unknown Reply (status 0x99, extended [])"
        );
    }

    #[test]
    fn test_identity_decoding() {
        let mut data = vec![
            0x01, 0x00, // vendor
            0x0E, 0x00, // device type
            0x36, 0x00, // product code
            20, 11, // revision
            0x60, 0x04, // status: major recoverable
            0x78, 0x56, 0x34, 0x12, // serial
        ];
        data.push(9);
        data.extend_from_slice(b"1756-L71/");

        let id = parse_identity(&data).unwrap();
        assert_eq!(id.vendor, 1);
        assert_eq!(id.device_type, 0x0E);
        assert_eq!(id.product_code, 0x36);
        assert_eq!(id.version, "20.11");
        assert_eq!(id.serial_number, 0x1234_5678);
        assert_eq!(id.name, "1756-L71/");
        assert!(id.faulted);
        assert!(id.major_recoverable_fault);
        assert!(!id.minor_recoverable_fault);
    }
}
