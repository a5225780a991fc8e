//! Reader18 wire protocol
//!
//! Packet format: `[LEN] [ADR] [CMD] [DATA...] [CRC_L] [CRC_H]` where LEN
//! counts every byte after itself (total packet size is LEN + 1). Response
//! packets carry a status byte between CMD and DATA. CRC is CRC-16/MCRF4XX
//! over everything preceding it, transmitted low byte first.

mod commands;
mod tags;

pub use commands::*;
pub use tags::{
    inventory_tag_count, parse_inventory_tags, parse_single_inventory, SingleInventoryResult,
    TagRead,
};

/// Inventory (Gen2, multi-tag).
pub const CMD_INVENTORY: u8 = 0x01;
/// One-shot single-tag inventory.
pub const CMD_INVENTORY_SINGLE: u8 = 0x0F;
/// Query module details.
pub const CMD_GET_READER_INFO: u8 = 0x21;
/// Set frequency window (region high/low bytes).
pub const CMD_SET_REGION: u8 = 0x22;
/// Set inventory duration unit (100 ms steps in common firmware).
pub const CMD_SET_SCAN_TIME: u8 = 0x25;
/// Set output power; 1-byte payload is global, 8-byte payload is per antenna.
pub const CMD_SET_OUTPUT_POWER: u8 = 0x2F;
/// Set work mode.
pub const CMD_SET_WORK_MODE: u8 = 0x35;
/// Set antenna multiplexing bitmap.
pub const CMD_SET_ANTENNA_MUX: u8 = 0x3F;

pub const STATUS_SUCCESS: u8 = 0x00;
/// "No tag" on 0x01; also the status under which 0x0F carries its result.
pub const STATUS_NO_TAG: u8 = 0x01;
pub const STATUS_ANTENNA_ERROR: u8 = 0xF8;
pub const STATUS_NO_TAG_OR_TIMEOUT: u8 = 0xFB;
pub const STATUS_CMD_ERROR: u8 = 0xFE;
pub const STATUS_CRC_ERROR: u8 = 0xFF;

pub const DEFAULT_READER_ADDRESS: u8 = 0x00;
pub const BROADCAST_READER_ADDRESS: u8 = 0xFF;

/// Smallest possible packet: LEN + ADR + CMD + STATUS + CRC.
const MIN_PACKET_LEN: usize = 6;

/// One decoded response frame.
///
/// `data` and `raw` are owned copies, valid after the source buffer is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub length: u8,
    pub address: u8,
    pub command: u8,
    pub status: u8,
    pub data: Vec<u8>,
    pub raw: Vec<u8>,
}

/// CRC-16/MCRF4XX: poly 0x8408, init 0xFFFF, reflected in/out, no final xor.
pub fn crc16_mcrf4xx(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Builds one wire packet for the given command and payload.
pub fn build_command(address: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 4) as u8;
    let mut packet = Vec::with_capacity(usize::from(length) + 1);
    packet.push(length);
    packet.push(address);
    packet.push(command);
    packet.extend_from_slice(payload);

    let crc = crc16_mcrf4xx(&packet);
    packet.push((crc & 0xFF) as u8);
    packet.push((crc >> 8) as u8);
    packet
}

/// Checks CRC validity for a full packet.
pub fn verify_packet(packet: &[u8]) -> bool {
    if packet.len() < MIN_PACKET_LEN {
        return false;
    }
    if usize::from(packet[0]) + 1 != packet.len() {
        return false;
    }
    let crc = crc16_mcrf4xx(&packet[..packet.len() - 2]);
    (crc & 0xFF) as u8 == packet[packet.len() - 2] && (crc >> 8) as u8 == packet[packet.len() - 1]
}

/// Decodes as many valid frames as possible from stream data.
///
/// Returns parsed frames and the bytes that were not enough for a full frame.
/// Garbage resynchronization advances exactly one byte per misalignment, so a
/// valid frame embedded after noise is still found.
pub fn parse_frames(stream: &[u8]) -> (Vec<Frame>, Vec<u8>) {
    let mut buf = stream;
    let mut frames = Vec::new();

    while buf.len() >= MIN_PACKET_LEN {
        let total = usize::from(buf[0]) + 1;
        if total < MIN_PACKET_LEN {
            buf = &buf[1..];
            continue;
        }
        if total > buf.len() {
            break;
        }

        let raw = &buf[..total];
        if !verify_packet(raw) {
            buf = &buf[1..];
            continue;
        }

        frames.push(Frame {
            length: raw[0],
            address: raw[1],
            command: raw[2],
            status: raw[3],
            data: raw[4..total - 2].to_vec(),
            raw: raw.to_vec(),
        });
        buf = &buf[total..];
    }

    (frames, buf.to_vec())
}
