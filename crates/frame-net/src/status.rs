//! Wire-level status bytes and size-header limits.

/// Success / proceed. Sent as the handshake byte and as the ACK that
/// authorises a sender to push a framed payload.
pub const SC_OK: u8 = 0xFF;

/// Receiver rejects the transmission (handshake failure or oversized
/// size header).
pub const SC_GENERIC_ERROR: u8 = 0x00;

/// Server is at its configured connection limit.
pub const SC_CONLIMIT: u8 = 0xFE;

/// Reserved, never emitted by this crate.
pub const SC_CONFLICT: u8 = 0xFD;

/// Largest legal payload length. Size headers above this value are
/// reserved for the in-band status bytes above: `MSG_MAX_SIZE`'s top byte
/// (`0xF0`) sits below every status code, so a receiver can always tell
/// a legal size header apart from a status byte by looking at the high
/// byte alone.
pub const MSG_MAX_SIZE: u32 = 0xF0FF_FFFF;
