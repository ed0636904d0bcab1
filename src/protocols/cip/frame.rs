// src/protocols/cip/frame.rs - EtherNet/IP encapsulation framing
use crate::error::{PlcError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Fixed size of the encapsulation header
pub const HEADER_LEN: usize = 24;

/// CPF item type of the null address item
pub const ITEM_NULL_ADDRESS: u16 = 0x0000;
/// CPF item type of the unconnected data item
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

/// Encapsulation commands used by the tester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    RegisterSession,
    UnregisterSession,
    SendRRData,
}

impl Command {
    pub fn code(&self) -> u16 {
        match self {
            Command::RegisterSession => 0x65,
            Command::UnregisterSession => 0x66,
            Command::SendRRData => 0x6F,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x65 => Some(Command::RegisterSession),
            0x66 => Some(Command::UnregisterSession),
            0x6F => Some(Command::SendRRData),
            _ => None,
        }
    }
}

/// One encapsulation packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encapsulation {
    pub command: u16,
    pub session: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
    pub data: Bytes,
}

impl Encapsulation {
    pub fn new(command: Command, session: u32, data: impl Into<Bytes>) -> Self {
        Self {
            command: command.code(),
            session,
            status: 0,
            context: [0; 8],
            options: 0,
            data: data.into(),
        }
    }

    /// Register Session request: protocol version 1, no option flags
    pub fn register_session() -> Self {
        Self::new(Command::RegisterSession, 0, vec![0x01, 0x00, 0x00, 0x00])
    }

    pub fn unregister_session(session: u32) -> Self {
        Self::new(Command::UnregisterSession, session, Bytes::new())
    }

    /// SendRRData carrying one unconnected CIP message
    pub fn send_rr_data(session: u32, timeout_s: u16, cip: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(16 + cip.len());
        data.put_u32_le(0); // interface handle
        data.put_u16_le(timeout_s);
        data.put_u16_le(2); // item count
        data.put_u16_le(ITEM_NULL_ADDRESS);
        data.put_u16_le(0);
        data.put_u16_le(ITEM_UNCONNECTED_DATA);
        data.put_u16_le(cip.len() as u16);
        data.put_slice(cip);
        Self::new(Command::SendRRData, session, data.freeze())
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command)
    }

    /// Extract the CIP message from a SendRRData payload
    pub fn unconnected_payload(&self) -> Result<Bytes> {
        let mut buf = self.data.clone();
        if buf.remaining() < 8 {
            return Err(malformed("SendRRData payload too short"));
        }
        buf.advance(6); // interface handle + timeout
        let count = buf.get_u16_le();
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(malformed("truncated CPF item header"));
            }
            let kind = buf.get_u16_le();
            let len = usize::from(buf.get_u16_le());
            if buf.remaining() < len {
                return Err(malformed("truncated CPF item"));
            }
            let item = buf.split_to(len);
            if kind == ITEM_UNCONNECTED_DATA {
                return Ok(item);
            }
        }
        Err(malformed("no unconnected data item"))
    }
}

fn malformed(what: &str) -> PlcError {
    PlcError::Protocol {
        status: 0,
        extended: Vec::new(),
        message: format!("Malformed encapsulation: {}", what),
    }
}

/// Length-delimited codec for encapsulation packets over TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct EncapsulationCodec;

impl Decoder for EncapsulationCodec {
    type Item = Encapsulation;
    type Error = PlcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Encapsulation>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = usize::from(u16::from_le_bytes([src[2], src[3]]));
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(HEADER_LEN + len);
        let command = packet.get_u16_le();
        packet.advance(2);
        let session = packet.get_u32_le();
        let status = packet.get_u32_le();
        let mut context = [0u8; 8];
        packet.copy_to_slice(&mut context);
        let options = packet.get_u32_le();

        Ok(Some(Encapsulation {
            command,
            session,
            status,
            context,
            options,
            data: packet.freeze(),
        }))
    }
}

impl Encoder<Encapsulation> for EncapsulationCodec {
    type Error = PlcError;

    fn encode(&mut self, item: Encapsulation, dst: &mut BytesMut) -> Result<()> {
        let len = u16::try_from(item.data.len()).map_err(|_| {
            PlcError::Validation(format!(
                "Encapsulation payload of {} bytes exceeds 65535",
                item.data.len()
            ))
        })?;
        dst.reserve(HEADER_LEN + item.data.len());
        dst.put_u16_le(item.command);
        dst.put_u16_le(len);
        dst.put_u32_le(item.session);
        dst.put_u32_le(item.status);
        dst.put_slice(&item.context);
        dst.put_u32_le(item.options);
        dst.put_slice(&item.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_session_bytes() {
        let mut buf = BytesMut::new();
        EncapsulationCodec
            .encode(Encapsulation::register_session(), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 28);
        assert_eq!(&buf[..4], &[0x65, 0x00, 0x04, 0x00]);
        assert_eq!(&buf[24..], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_waits_for_full_packet() {
        let mut wire = BytesMut::new();
        EncapsulationCodec
            .encode(Encapsulation::send_rr_data(7, 10, &[0x4C, 0x00]), &mut wire)
            .unwrap();

        let mut partial = BytesMut::from(&wire[..30]);
        assert!(EncapsulationCodec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&wire[30..]);
        let packet = EncapsulationCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(packet.command(), Some(Command::SendRRData));
        assert_eq!(packet.session, 7);
        assert_eq!(packet.unconnected_payload().unwrap().as_ref(), &[0x4C, 0x00]);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_only_session_commands_are_known() {
        for command in [
            Command::RegisterSession,
            Command::UnregisterSession,
            Command::SendRRData,
        ] {
            assert_eq!(Command::from_code(command.code()), Some(command));
        }
        assert_eq!(Command::from_code(0x63), None);
        assert_eq!(Command::from_code(0x70), None);
    }

    #[test]
    fn test_missing_data_item() {
        let packet = Encapsulation::new(Command::SendRRData, 1, vec![0u8; 8]);
        assert!(packet.unconnected_payload().is_err());
    }
}
