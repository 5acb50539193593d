//! Intel-HEX decoder for loading boot images into emulator memory.

use crate::error::{CpmError, CpmResult};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;

/// Decode an Intel-HEX text image into a flat byte buffer.
///
/// Output starts at `min(lowest address seen, 0x0100)` and spans to the
/// highest address written; bytes never touched by a data record are left
/// zero. A record type `01` (EOF) stops decoding; other record types are
/// skipped. Line endings may be `\n` or `\r\n`. Checksums are not verified.
pub fn decode(text: &str) -> CpmResult<Vec<u8>> {
    let mut writes: Vec<(u16, Vec<u8>)> = Vec::new();
    let mut min_addr = 0x0100u32;
    let mut max_addr = 0u32;
    let mut saw_any = false;

    for raw_line in text.lines() {
        let line = raw_line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        let line = line
            .strip_prefix(':')
            .ok_or_else(|| CpmError::InvalidHex(format!("missing ':' in {line:?}")))?;

        let bytes = hex_bytes(line)?;
        if bytes.len() < 5 {
            return Err(CpmError::InvalidHex("record too short".to_string()));
        }

        let count = bytes[0] as usize;
        let address = u16::from_be_bytes([bytes[1], bytes[2]]);
        let record_type = bytes[3];
        let data = &bytes[4..bytes.len() - 1];

        if data.len() != count {
            return Err(CpmError::InvalidHex(format!(
                "byte count {count} doesn't match data length {}",
                data.len()
            )));
        }

        match record_type {
            RECORD_EOF => break,
            RECORD_DATA => {
                if !data.is_empty() {
                    saw_any = true;
                    min_addr = min_addr.min(address as u32);
                    max_addr = max_addr.max(address as u32 + data.len() as u32);
                    writes.push((address, data.to_vec()));
                }
            }
            _ => continue,
        }
    }

    if !saw_any {
        return Ok(Vec::new());
    }

    let mut out = vec![0u8; (max_addr - min_addr) as usize];
    for (address, data) in writes {
        let start = address as u32 - min_addr;
        out[start as usize..start as usize + data.len()].copy_from_slice(&data);
    }
    Ok(out)
}

/// The load address `decode`'s output buffer starts at, for a given text
/// image (mirrors the `min(min_address_seen, 0x0100)` rule without decoding).
pub fn base_address(text: &str) -> CpmResult<u16> {
    let mut min_addr = 0x0100u32;
    for raw_line in text.lines() {
        let line = raw_line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        let Some(line) = line.strip_prefix(':') else {
            continue;
        };
        let Ok(bytes) = hex_bytes(line) else {
            continue;
        };
        if bytes.len() < 5 {
            continue;
        }
        let count = bytes[0] as usize;
        let address = u16::from_be_bytes([bytes[1], bytes[2]]);
        let record_type = bytes[3];
        if record_type == RECORD_EOF {
            break;
        }
        if record_type == RECORD_DATA && count > 0 {
            min_addr = min_addr.min(address as u32);
        }
    }
    Ok(min_addr as u16)
}

fn hex_bytes(s: &str) -> CpmResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(CpmError::InvalidHex("odd number of hex digits".to_string()));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let chars: Vec<char> = s.chars().collect();
    for pair in chars.chunks(2) {
        let byte_str: String = pair.iter().collect();
        let byte = u8::from_str_radix(&byte_str, 16)
            .map_err(|_| CpmError::InvalidHex(format!("invalid hex digits {byte_str:?}")))?;
        out.push(byte);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_data_record() {
        // :03 0100 00 C30000 CA
        let text = ":03010000C30000CA\n:00000001FF\n";
        let result = decode(text).unwrap();
        assert_eq!(result, vec![0xC3, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_starts_at_0x0100_minimum() {
        // Data at 0x0200 only: output still spans from 0x0100.
        let text = ":01020000AAD6\n:00000001FF\n";
        let result = decode(text).unwrap();
        assert_eq!(result.len(), 0x0200 + 1 - 0x0100);
        assert_eq!(result[0x0100], 0xAA);
    }

    #[test]
    fn test_decode_lower_than_0x0100() {
        let text = ":0100000090F1\n:00000001FF\n";
        let result = decode(text).unwrap();
        assert_eq!(result[0], 0x90);
    }

    #[test]
    fn test_decode_stops_at_eof_record() {
        let text = ":01000000AAD4\n:00000001FF\n:0101000155CA\n";
        let result = decode(text).unwrap();
        // The record after EOF must be ignored.
        assert_eq!(result, vec![0xAA]);
    }

    #[test]
    fn test_decode_skips_unknown_record_types() {
        let text = ":020000020000FC\n:01010000BBC3\n:00000001FF\n";
        let result = decode(text).unwrap();
        assert_eq!(result, vec![0xBB]);
    }

    #[test]
    fn test_decode_crlf_line_endings() {
        let text = ":01010000BBC3\r\n:00000001FF\r\n";
        let result = decode(text).unwrap();
        assert_eq!(result, vec![0xBB]);
    }

    #[test]
    fn test_decode_rejects_missing_colon() {
        let text = "01010000BBC3\n";
        assert!(decode(text).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_byte_count() {
        let text = ":02010000BB\n"; // count says 2 but only 1 data byte
        assert!(decode(text).is_err());
    }

    #[test]
    fn test_base_address() {
        let text = ":01020000AAD6\n:00000001FF\n";
        assert_eq!(base_address(text).unwrap(), 0x0100);

        let text2 = ":0100000090F1\n:00000001FF\n";
        assert_eq!(base_address(text2).unwrap(), 0x0000);
    }
}
