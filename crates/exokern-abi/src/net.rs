//! Network-server request codes and the packet page layout

/// Input relay -> network server: a received frame
pub const NSREQ_INPUT: u32 = 10;
/// Network server -> output relay: a frame to transmit
pub const NSREQ_OUTPUT: u32 = 11;

/// Packet pages start with a little-endian `i32` length
pub const PACKET_LEN_SIZE: usize = 4;
/// Frame bytes follow the length header
pub const PACKET_DATA_OFFSET: usize = PACKET_LEN_SIZE;
/// Largest Ethernet frame the rings carry (no jumbo frames)
pub const MAX_PACKET_LEN: usize = 1518;

/// Write the length header of a packet page.
pub fn encode_len(len: usize) -> [u8; PACKET_LEN_SIZE] {
    (len as i32).to_le_bytes()
}

/// Read the length header of a packet page, rejecting impossible sizes.
pub fn decode_len(header: [u8; PACKET_LEN_SIZE]) -> Option<usize> {
    let len = i32::from_le_bytes(header);
    usize::try_from(len).ok().filter(|len| *len <= MAX_PACKET_LEN)
}
