//! Intel HEX reading.
//!
//! AVR toolchains ship firmware as Intel HEX text. Only the amount of
//! program data matters here: it is checked against the board's flash size
//! before the programmer is started.
//!
//! ```text
//! :LLAAAATT<data...>CC
//!  |  |   |         +-- checksum
//!  |  |   +------------ record type (00 data, 01 EOF, ...)
//!  |  +---------------- load offset
//!  +------------------- data length
//! ```

use crate::error::{Error, Result};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;

fn hex_byte(text: &str, at: usize, line_no: usize) -> Result<u8> {
    text.get(at..at + 2)
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| Error::InvalidImage(format!("line {line_no}: bad hex digits")))
}

/// Count the data bytes of an Intel HEX file.
///
/// Record checksums are verified; everything after the EOF record is
/// ignored.
pub fn data_size(text: &str) -> Result<usize> {
    let mut total = 0;
    for (i, line) in text
        .lines()
        .enumerate()
    {
        let line_no = i + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(record) = line.strip_prefix(':') else {
            return Err(Error::InvalidImage(format!(
                "line {line_no}: missing ':' start code"
            )));
        };
        if record.len() < 10 || record.len() % 2 != 0 {
            return Err(Error::InvalidImage(format!(
                "line {line_no}: record too short"
            )));
        }

        let bytes = (0..record.len() / 2)
            .map(|n| hex_byte(record, n * 2, line_no))
            .collect::<Result<Vec<u8>>>()?;
        let len = usize::from(bytes[0]);
        if bytes.len() != len + 5 {
            return Err(Error::InvalidImage(format!(
                "line {line_no}: length field says {len} bytes"
            )));
        }
        let sum = bytes
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(Error::InvalidImage(format!(
                "line {line_no}: checksum mismatch"
            )));
        }

        match bytes[3] {
            RECORD_DATA => total += len,
            RECORD_EOF => break,
            _ => {},
        }
    }
    Ok(total)
}
