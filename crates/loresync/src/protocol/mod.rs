use lib0::decoding::{Cursor, Read};
use lib0::encoding::Write;

use crate::error::{SyncError, SyncResult};

const MSG_SYNC: u32 = 0;
const MSG_AWARENESS: u32 = 1;
const MSG_AUTH: u32 = 2;
const MSG_QUERY_AWARENESS: u32 = 3;

const SYNC_STEP1: u32 = 0;
const SYNC_STEP2: u32 = 1;
const SYNC_UPDATE: u32 = 2;

const AUTH_PERMISSION_DENIED: u32 = 0;

/// Frames exchanged over a remote sync channel, in both directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// State vector of the sender, asks the peer for everything it is missing
    SyncStep1(Vec<u8>),
    /// Update answering a `SyncStep1`
    SyncStep2(Vec<u8>),
    /// Incremental update produced after the handshake
    Update(Vec<u8>),
    /// Encoded awareness update, see [`crate::awareness::AwarenessUpdate`]
    Awareness(Vec<u8>),
    /// The peer refused access to the document
    PermissionDenied(String),
    /// Ask the peer to send its full awareness state
    QueryAwareness,
}

impl Frame {
    /// Encode a frame using lib0 format
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Vec::new();
        match self {
            Frame::SyncStep1(state_vector) => {
                encoder.write_var(MSG_SYNC);
                encoder.write_var(SYNC_STEP1);
                encoder.write_buf(state_vector);
            }
            Frame::SyncStep2(update) => {
                encoder.write_var(MSG_SYNC);
                encoder.write_var(SYNC_STEP2);
                encoder.write_buf(update);
            }
            Frame::Update(update) => {
                encoder.write_var(MSG_SYNC);
                encoder.write_var(SYNC_UPDATE);
                encoder.write_buf(update);
            }
            Frame::Awareness(payload) => {
                encoder.write_var(MSG_AWARENESS);
                encoder.write_buf(payload);
            }
            Frame::PermissionDenied(reason) => {
                encoder.write_var(MSG_AUTH);
                encoder.write_var(AUTH_PERMISSION_DENIED);
                encoder.write_string(reason);
            }
            Frame::QueryAwareness => {
                encoder.write_var(MSG_QUERY_AWARENESS);
            }
        }
        encoder
    }

    /// Decode a frame from lib0 format
    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        let mut decoder = Cursor::new(data);
        let tag: u32 = decoder.read_var().map_err(decode_error)?;

        let frame = match tag {
            MSG_SYNC => {
                let sub: u32 = decoder.read_var().map_err(decode_error)?;
                let payload = decoder.read_buf().map_err(decode_error)?.to_vec();
                match sub {
                    SYNC_STEP1 => Frame::SyncStep1(payload),
                    SYNC_STEP2 => Frame::SyncStep2(payload),
                    SYNC_UPDATE => Frame::Update(payload),
                    other => {
                        return Err(SyncError::Decode(format!(
                            "unknown sync message type {}",
                            other
                        )))
                    }
                }
            }
            MSG_AWARENESS => Frame::Awareness(decoder.read_buf().map_err(decode_error)?.to_vec()),
            MSG_AUTH => {
                let sub: u32 = decoder.read_var().map_err(decode_error)?;
                if sub != AUTH_PERMISSION_DENIED {
                    return Err(SyncError::Decode(format!(
                        "unknown auth message type {}",
                        sub
                    )));
                }
                Frame::PermissionDenied(decoder.read_string().map_err(decode_error)?.to_string())
            }
            MSG_QUERY_AWARENESS => Frame::QueryAwareness,
            other => {
                return Err(SyncError::Decode(format!(
                    "unknown message type {}",
                    other
                )))
            }
        };
        Ok(frame)
    }
}

pub(crate) fn decode_error(e: lib0::error::Error) -> SyncError {
    SyncError::Decode(format!("Failed to decode lib0 frame: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_carries_reason() {
        let encoded = Frame::PermissionDenied("token expired".to_string()).encode();
        assert_eq!(&encoded[..2], &[2, 0]);
        assert_eq!(
            Frame::decode(&encoded).unwrap(),
            Frame::PermissionDenied("token expired".to_string())
        );
    }

    #[test]
    fn test_wire_layout_matches_sync_protocol() {
        assert_eq!(Frame::SyncStep1(vec![7]).encode(), vec![0, 0, 1, 7]);
        assert_eq!(Frame::Update(vec![5, 6]).encode(), vec![0, 2, 2, 5, 6]);
        assert_eq!(Frame::QueryAwareness.encode(), vec![3]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Frame::decode(&[]), Err(SyncError::Decode(_))));
        assert!(matches!(Frame::decode(&[0, 9, 0]), Err(SyncError::Decode(_))));
        assert!(matches!(Frame::decode(&[42]), Err(SyncError::Decode(_))));
        assert!(matches!(Frame::decode(&[0, 0, 5, 1]), Err(SyncError::Decode(_))));
    }
}
