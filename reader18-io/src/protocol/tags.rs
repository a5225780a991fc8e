//! Payload decoders for inventory responses.

use super::{Frame, CMD_INVENTORY, CMD_INVENTORY_SINGLE, STATUS_NO_TAG, STATUS_SUCCESS};
use crate::error::{Error, Result};

/// One tag read decoded from a Gen2 inventory response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRead {
    pub antenna: u8,
    pub rssi: u8,
    pub epc: Vec<u8>,
}

/// Decoded response of the single-tag inventory command (0x0F).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleInventoryResult {
    pub antenna: u8,
    pub tag_count: u8,
    pub epc: Vec<u8>,
}

/// Decodes tag records from a Gen2 inventory response payload.
///
/// Payload layout: antenna, tag count, then per tag: EPC length, EPC bytes,
/// RSSI. No-tag statuses and count-only payloads decode to an empty list;
/// a payload that claims tags but runs short is an error.
pub fn parse_inventory_tags(frame: &Frame) -> Result<Vec<TagRead>> {
    if frame.command != CMD_INVENTORY {
        return Err(Error::InvalidPacket("not an inventory frame".into()));
    }
    if frame.status != STATUS_SUCCESS || frame.data.len() < 2 {
        return Ok(Vec::new());
    }

    let antenna = frame.data[0];
    let count = usize::from(frame.data[1]);
    let mut tags = Vec::with_capacity(count);
    let mut offset = 2;

    for _ in 0..count {
        if offset >= frame.data.len() {
            return Err(Error::InvalidPacket("truncated tag record".into()));
        }
        let epc_len = usize::from(frame.data[offset]);
        offset += 1;
        if frame.data.len() < offset + epc_len + 1 {
            return Err(Error::InvalidPacket("truncated tag record".into()));
        }
        let epc = frame.data[offset..offset + epc_len].to_vec();
        offset += epc_len;
        let rssi = frame.data[offset];
        offset += 1;
        tags.push(TagRead { antenna, rssi, epc });
    }

    Ok(tags)
}

/// Extracts the tag count from a count-only inventory response.
///
/// Some firmwares answer 0x01 with nothing but the number of EPCs seen; the
/// count is the first payload byte. Non-success or empty payloads count zero.
pub fn inventory_tag_count(frame: &Frame) -> Result<usize> {
    if frame.command != CMD_INVENTORY {
        return Err(Error::InvalidPacket("not an inventory frame".into()));
    }
    if frame.status != STATUS_SUCCESS || frame.data.is_empty() {
        return Ok(0);
    }
    Ok(usize::from(frame.data[0]))
}

/// Decodes the single-tag inventory payload: antenna, count, EPC length, EPC.
pub fn parse_single_inventory(frame: &Frame) -> Result<SingleInventoryResult> {
    if frame.command != CMD_INVENTORY_SINGLE {
        return Err(Error::InvalidPacket("not a single-inventory frame".into()));
    }
    if frame.status != STATUS_NO_TAG {
        return Err(Error::InvalidPacket(format!(
            "single-inventory status 0x{:02X}",
            frame.status
        )));
    }
    if frame.data.len() < 3 {
        return Err(Error::InvalidPacket("single-inventory payload too short".into()));
    }

    let antenna = frame.data[0];
    let tag_count = frame.data[1];
    let epc_len = usize::from(frame.data[2]);
    if frame.data.len() < 3 + epc_len {
        return Err(Error::InvalidPacket("single-inventory invalid epc len".into()));
    }

    Ok(SingleInventoryResult {
        antenna,
        tag_count,
        epc: frame.data[3..3 + epc_len].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_command, parse_frames, STATUS_NO_TAG_OR_TIMEOUT};

    fn response_frame(command: u8, status: u8, payload: &[u8]) -> Frame {
        let mut data = vec![status];
        data.extend_from_slice(payload);
        let packet = build_command(0x01, command, &data);
        let (mut frames, _) = parse_frames(&packet);
        frames.remove(0)
    }

    #[test]
    fn g2_payload_decodes_multiple_tags() {
        // antenna 0x81, two tags: 2-byte EPC rssi 0x30, 3-byte EPC rssi 0x28
        let payload = [0x81, 0x02, 0x02, 0xAA, 0xBB, 0x30, 0x03, 0x01, 0x02, 0x03, 0x28];
        let frame = response_frame(CMD_INVENTORY, STATUS_SUCCESS, &payload);

        let tags = parse_inventory_tags(&frame).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0], TagRead { antenna: 0x81, rssi: 0x30, epc: vec![0xAA, 0xBB] });
        assert_eq!(tags[1].epc, vec![0x01, 0x02, 0x03]);
        assert_eq!(tags[1].rssi, 0x28);
    }

    #[test]
    fn g2_no_tag_status_is_empty_not_error() {
        let frame = response_frame(CMD_INVENTORY, STATUS_NO_TAG_OR_TIMEOUT, &[]);
        assert!(parse_inventory_tags(&frame).unwrap().is_empty());
    }

    #[test]
    fn g2_count_only_payload_is_empty() {
        let frame = response_frame(CMD_INVENTORY, STATUS_SUCCESS, &[0x05]);
        assert!(parse_inventory_tags(&frame).unwrap().is_empty());
        assert_eq!(inventory_tag_count(&frame).unwrap(), 5);
    }

    #[test]
    fn g2_truncated_record_errors() {
        let payload = [0x80, 0x01, 0x08, 0xAA, 0xBB];
        let frame = response_frame(CMD_INVENTORY, STATUS_SUCCESS, &payload);
        assert!(matches!(
            parse_inventory_tags(&frame),
            Err(Error::InvalidPacket(_))
        ));
    }

    #[test]
    fn single_inventory_decodes_epc() {
        let payload = [0x80, 0x01, 0x04, 0xDE, 0xAD, 0xBE, 0xEF];
        let frame = response_frame(CMD_INVENTORY_SINGLE, STATUS_NO_TAG, &payload);

        let result = parse_single_inventory(&frame).unwrap();
        assert_eq!(result.antenna, 0x80);
        assert_eq!(result.tag_count, 1);
        assert_eq!(result.epc, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn single_inventory_rejects_other_statuses() {
        let frame = response_frame(CMD_INVENTORY_SINGLE, STATUS_SUCCESS, &[0x80, 0x00, 0x00]);
        assert!(parse_single_inventory(&frame).is_err());
    }

    #[test]
    fn single_inventory_rejects_short_payload() {
        let frame = response_frame(CMD_INVENTORY_SINGLE, STATUS_NO_TAG, &[0x80]);
        assert!(parse_single_inventory(&frame).is_err());
    }

    #[test]
    fn count_only_ignores_no_tag_status() {
        let frame = response_frame(CMD_INVENTORY, STATUS_NO_TAG, &[0x07]);
        assert_eq!(inventory_tag_count(&frame).unwrap(), 0);
    }
}
