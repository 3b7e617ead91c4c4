//! Encoding of events for the wire.
//!
//! Two formats are supported: JSON (text frames, friendly to browser
//! terminals) and MessagePack (binary frames, compact for output-heavy
//! sessions). Both encode the same event structures.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum encoded message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Wire format of an encoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON text.
    #[default]
    Json,
    /// MessagePack binary.
    MessagePack,
}

/// Encodes a value in the given format.
pub fn encode<T: Serialize>(value: &T, format: WireFormat) -> Result<Vec<u8>> {
    let bytes = match format {
        WireFormat::Json => serde_json::to_vec(value)?,
        WireFormat::MessagePack => rmp_serde::to_vec_named(value)?,
    };

    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(bytes)
}

/// Decodes a value from the given format.
///
/// Inputs larger than [`MAX_MESSAGE_SIZE`] are rejected before parsing.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], format: WireFormat) -> Result<T> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    match format {
        WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
        WireFormat::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, ServerEvent, SessionOutput, SessionResize};
    use bytes::Bytes;

    #[test]
    fn test_msgpack_output_keeps_raw_bytes() {
        let event = ServerEvent::SessionOutput(SessionOutput {
            bridge_id: "abc_1".to_string(),
            role: "HostM".to_string(),
            data: Bytes::from_static(&[0x1b, b'[', b'0', b'm', 0xff]),
        });

        let bytes = encode(&event, WireFormat::MessagePack).unwrap();
        let decoded: ServerEvent = decode(&bytes, WireFormat::MessagePack).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_msgpack_is_smaller_than_json_for_output() {
        let event = ServerEvent::SessionOutput(SessionOutput {
            bridge_id: "abc_1".to_string(),
            role: "HostM".to_string(),
            data: Bytes::from(vec![b'x'; 512]),
        });

        let json = encode(&event, WireFormat::Json).unwrap();
        let msgpack = encode(&event, WireFormat::MessagePack).unwrap();
        assert!(msgpack.len() < json.len());
    }

    #[test]
    fn test_json_resize_decodes() {
        let raw = br#"{"event":"session_resize","data":{"rows":40,"cols":120}}"#;
        let event: ClientEvent = decode(raw, WireFormat::Json).unwrap();
        assert_eq!(
            event,
            ClientEvent::SessionResize(SessionResize { rows: 40, cols: 120 })
        );
    }

    #[test]
    fn test_decode_rejects_oversized_input() {
        let raw = vec![b' '; MAX_MESSAGE_SIZE + 1];
        let result: Result<ClientEvent> = decode(&raw, WireFormat::Json);
        assert!(matches!(
            result,
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_output() {
        let event = ServerEvent::SessionOutput(SessionOutput {
            bridge_id: "b".to_string(),
            role: "r".to_string(),
            data: Bytes::from(vec![0u8; MAX_MESSAGE_SIZE]),
        });
        assert!(matches!(
            encode(&event, WireFormat::MessagePack),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_garbage_is_deserialization_error() {
        let result: Result<ClientEvent> = decode(b"\x00\x01", WireFormat::Json);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }
}
