use crate::{Command, ProtocolError};

/// Every command travels as one little-endian `u32`.
pub const TOKEN_LEN: usize = 4;

pub fn encode_token(command: Command) -> [u8; TOKEN_LEN] {
    command.as_u32().to_le_bytes()
}

/// Decodes the token at the head of `bytes`. Fewer than [`TOKEN_LEN`]
/// bytes means the peer closed the stream mid-token.
pub fn decode_token(bytes: &[u8]) -> Result<Command, ProtocolError> {
    let raw: [u8; TOKEN_LEN] = bytes
        .get(..TOKEN_LEN)
        .and_then(|head| head.try_into().ok())
        .ok_or(ProtocolError::Truncated {
            received: bytes.len(),
        })?;
    let value = u32::from_le_bytes(raw);
    Command::from_u32(value).ok_or(ProtocolError::UnknownToken(value))
}
