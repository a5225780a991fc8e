//! Command builders: thin wrappers around [`build_command`](super::build_command).

use super::{
    build_command, CMD_GET_READER_INFO, CMD_INVENTORY, CMD_INVENTORY_SINGLE, CMD_SET_ANTENNA_MUX,
    CMD_SET_OUTPUT_POWER, CMD_SET_REGION, CMD_SET_SCAN_TIME, CMD_SET_WORK_MODE,
};

/// Plain inventory command (0x01, no payload).
pub fn inventory_command(address: u8) -> Vec<u8> {
    build_command(address, CMD_INVENTORY, &[])
}

/// Inventory command with TID address/length payload.
pub fn inventory_tid_command(address: u8, tid_addr: u8, tid_len: u8) -> Vec<u8> {
    build_command(address, CMD_INVENTORY, &[tid_addr, tid_len])
}

/// One-shot single-tag inventory (0x0F).
pub fn inventory_single_command(address: u8) -> Vec<u8> {
    build_command(address, CMD_INVENTORY_SINGLE, &[])
}

/// Gen2 inventory round with explicit air-protocol parameters.
///
/// Payload layout: Q, session, mask address, mask length, target, antenna,
/// scan time.
#[allow(clippy::too_many_arguments)]
pub fn inventory_g2_command(
    address: u8,
    q_value: u8,
    session: u8,
    mask_addr: u8,
    mask_len: u8,
    target: u8,
    antenna: u8,
    scan_time: u8,
) -> Vec<u8> {
    build_command(
        address,
        CMD_INVENTORY,
        &[q_value, session, mask_addr, mask_len, target, antenna, scan_time],
    )
}

/// Queries module details (0x21).
pub fn reader_info_command(address: u8) -> Vec<u8> {
    build_command(address, CMD_GET_READER_INFO, &[])
}

/// Sets the frequency window high/low channel bytes (0x22).
pub fn set_region_command(address: u8, high: u8, low: u8) -> Vec<u8> {
    build_command(address, CMD_SET_REGION, &[high, low])
}

/// Sets inventory duration in 100 ms steps (0x25).
pub fn set_scan_time_command(address: u8, value: u8) -> Vec<u8> {
    build_command(address, CMD_SET_SCAN_TIME, &[value])
}

/// Sets global output power (0x2F, one byte).
pub fn set_output_power_command(address: u8, value: u8) -> Vec<u8> {
    build_command(address, CMD_SET_OUTPUT_POWER, &[value])
}

/// Sets per-antenna output power (0x2F, one byte per port).
pub fn set_output_power_by_antenna_command(address: u8, table: &[u8]) -> Vec<u8> {
    build_command(address, CMD_SET_OUTPUT_POWER, table)
}

/// Sets the work mode payload (0x35).
pub fn set_work_mode_command(address: u8, payload: &[u8]) -> Vec<u8> {
    build_command(address, CMD_SET_WORK_MODE, payload)
}

/// Sets the antenna multiplexing bitmap (0x3F).
pub fn set_antenna_mux_command(address: u8, mask: u8) -> Vec<u8> {
    build_command(address, CMD_SET_ANTENNA_MUX, &[mask])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::verify_packet;

    #[test]
    fn builders_produce_verifiable_packets() {
        let packets = [
            inventory_command(0x00),
            inventory_tid_command(0x00, 0x20, 0x04),
            inventory_single_command(0xFF),
            inventory_g2_command(0x01, 4, 1, 0, 0, 0, 0x80, 1),
            reader_info_command(0xFF),
            set_region_command(0x00, 0x93, 0x81),
            set_scan_time_command(0x00, 10),
            set_output_power_command(0x00, 0x1E),
            set_output_power_by_antenna_command(0x00, &[30, 30, 30, 30, 0, 0, 0, 0]),
            set_work_mode_command(0x00, &[0x00]),
            set_antenna_mux_command(0x00, 0x0F),
        ];
        for packet in packets {
            assert!(verify_packet(&packet), "packet {:02X?}", packet);
        }
    }

    #[test]
    fn g2_command_payload_layout() {
        let packet = inventory_g2_command(0x01, 0x04, 0x02, 0x00, 0x00, 0x01, 0x82, 0x05);
        assert_eq!(packet[0], 7 + 4); // payload + framing overhead
        assert_eq!(packet[1], 0x01);
        assert_eq!(packet[2], CMD_INVENTORY);
        assert_eq!(&packet[3..10], &[0x04, 0x02, 0x00, 0x00, 0x01, 0x82, 0x05]);
    }

    #[test]
    fn scan_time_single_byte_payload() {
        let packet = set_scan_time_command(0x00, 3);
        assert_eq!(packet.len(), 7);
        assert_eq!(packet[3], 3);
    }
}
