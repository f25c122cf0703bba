pub mod convert;
pub mod parser;
pub mod types;
pub mod writer;

pub use convert::FromResp;
pub use parser::{frame_len, parse, parse_slice, parse_split, ReadOptions, Split};
pub use types::{BigNumber, MessageKind, Protocol, RespResult, RespValue};
pub use writer::{encode_command, encode_pipeline, ErrorReply, RespWriter, Status, ToResp};

use crate::error::{RespError, Result};

/// Decode exactly one RESP unit from wire text, e.g. `"*1\r\n:1\r\n"`.
///
/// Trailing bytes after the unit are an error.
pub fn deserialize_resp_text(text: &str) -> Result<RespValue> {
    let (unit, consumed) = parse_slice(text.as_bytes(), ReadOptions::text())?;
    if consumed != text.len() {
        return Err(RespError::Protocol(format!(
            "{} trailing bytes after RESP value",
            text.len() - consumed
        )));
    }
    Ok(unit.value)
}

/// Render a value as RESP wire text (lossy for non-UTF-8 payloads).
pub fn serialize_resp_text<T: ToResp + ?Sized>(value: &T, protocol: Protocol) -> String {
    let mut w = RespWriter::new(protocol);
    w.write(value);
    String::from_utf8_lossy(w.as_bytes()).into_owned()
}
