//! Spill file encoding: a header followed by length-prefixed row frames.
//!
//! ```text
//! "RFSP" | version: u32 LE | (len: u32 LE | bincode(Row))*
//! ```
//!
//! Files live only as long as the stage that wrote them, so the version is a sanity check and
//! not a compatibility promise.

use std::io::{self, Read, Write};

use rowflow_common::{Result, RowflowError};
use rowflow_execution::Row;

pub const SPILL_MAGIC: &[u8; 4] = b"RFSP";
pub const SPILL_VERSION: u32 = 1;
pub const SPILL_HEADER_LEN: u64 = 8;

pub fn write_header(out: &mut impl Write) -> Result<()> {
    out.write_all(SPILL_MAGIC)?;
    out.write_all(&SPILL_VERSION.to_le_bytes())?;
    Ok(())
}

pub fn read_header(input: &mut impl Read) -> Result<()> {
    let mut header = [0_u8; 8];
    input.read_exact(&mut header)?;
    if &header[..4] != SPILL_MAGIC {
        return Err(RowflowError::Spill("invalid spill file magic".to_string()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != SPILL_VERSION {
        return Err(RowflowError::Spill(format!(
            "unsupported spill file version {version}"
        )));
    }
    Ok(())
}

pub fn encode_row(row: &Row) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| RowflowError::Spill(format!("row encode failed: {e}")))
}

pub fn decode_row(bytes: &[u8]) -> Result<Row> {
    let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RowflowError::Spill(format!("row decode failed: {e}")))?;
    Ok(row)
}

/// Write one frame and return the number of bytes written.
pub fn write_frame(out: &mut impl Write, row: &Row) -> Result<u64> {
    let payload = encode_row(row)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| RowflowError::Spill(format!("row too large: {} bytes", payload.len())))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    Ok(4 + u64::from(len))
}

/// Read the next frame, or `None` at a clean end of file.
pub fn read_frame(input: &mut impl Read) -> Result<Option<Row>> {
    let mut len = [0_u8; 4];
    match input.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut payload = vec![0_u8; u32::from_le_bytes(len) as usize];
    input
        .read_exact(&mut payload)
        .map_err(|e| RowflowError::Spill(format!("truncated spill frame: {e}")))?;
    decode_row(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use chrono::NaiveDate;
    use rowflow_execution::{Row, Value};
    use rust_decimal::Decimal;

    use super::{read_frame, read_header, write_frame, write_header};

    #[test]
    fn frames_carry_every_value_kind() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .expect("date");
        let row = Row::new(vec![
            Value::Null,
            Value::Integer(-7),
            Value::Number(1.5),
            Value::Decimal(Decimal::new(12345, 3)),
            Value::from("B"),
            Value::Date(date),
            Value::Boolean(true),
            Value::Binary(vec![0, 255]),
        ]);

        let mut buf = Vec::new();
        write_header(&mut buf).expect("header");
        let bytes = write_frame(&mut buf, &row).expect("frame");
        assert_eq!(buf.len() as u64, 8 + bytes);

        let mut cursor = Cursor::new(buf);
        read_header(&mut cursor).expect("read header");
        assert_eq!(read_frame(&mut cursor).expect("frame"), Some(row));
        assert_eq!(read_frame(&mut cursor).expect("eof"), None);
    }

    #[test]
    fn rejects_foreign_header() {
        let mut cursor = Cursor::new(b"NOPE\x01\x00\x00\x00".to_vec());
        let err = read_header(&mut cursor).expect_err("bad magic");
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn truncated_frame_is_a_spill_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Row::new(vec![Value::from("abc")])).expect("frame");
        buf.truncate(buf.len() - 1);
        let err = read_frame(&mut Cursor::new(buf)).expect_err("truncated");
        assert_eq!(err.code(), "SPILL");
    }
}
