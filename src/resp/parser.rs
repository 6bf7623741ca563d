//! Streaming RESP parser.
//!
//! [`parse`] takes a byte buffer and returns `Ok((Reply, bytes_consumed))`,
//! `Err(Incomplete)` when more data is needed, or `Err(Protocol(…))` on
//! malformed input. Nothing is materialised until the whole reply is in the
//! buffer, so a caller can keep appending socket reads and retry.
//!
//! Bulk payloads are extracted with `Bytes::slice`, sharing the read buffer
//! instead of copying.

use crate::error::{RedshardError, Result};
use crate::resp::types::Reply;
use bytes::Bytes;
use memchr::memchr;

/// Parse one reply from the front of `buf`.
///
/// A top-level error reply comes back as [`Reply::Error`] together with its
/// length so the caller can still advance past it; use [`into_result`] to
/// turn it into a [`RedshardError::Server`].
pub fn parse(buf: &Bytes) -> Result<(Reply, usize)> {
    if buf.is_empty() {
        return Err(RedshardError::Incomplete);
    }

    match buf[0] {
        b'+' => parse_status(buf),
        b'-' => parse_error(buf),
        b':' => parse_integer(buf),
        b'$' => parse_bulk(buf),
        b'*' => parse_multi_bulk(buf),
        other => Err(RedshardError::Protocol(format!(
            "unknown reply type byte: 0x{other:02x}"
        ))),
    }
}

/// Convenience wrapper: parse from a byte slice (copies into `Bytes` first).
pub fn parse_slice(buf: &[u8]) -> Result<(Reply, usize)> {
    parse(&Bytes::copy_from_slice(buf))
}

/// Decode one complete reply, raising a top-level error reply as
/// [`RedshardError::Server`].
pub fn decode(buf: &[u8]) -> Result<Reply> {
    let (reply, _) = parse_slice(buf)?;
    into_result(reply)
}

/// Surface a top-level error reply as an `Err`; pass everything else through.
pub fn into_result(reply: Reply) -> Result<Reply> {
    match reply {
        Reply::Error(msg) => Err(RedshardError::server(msg)),
        other => Ok(other),
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Find the next `\r\n` in `buf` starting at `offset`.
/// Returns the index of `\r`.
#[inline]
fn find_crlf(buf: &[u8], offset: usize) -> Result<usize> {
    let search = &buf[offset..];
    match memchr(b'\r', search) {
        Some(pos) => {
            let abs = offset + pos;
            if abs + 1 < buf.len() && buf[abs + 1] == b'\n' {
                Ok(abs)
            } else if abs + 1 >= buf.len() {
                Err(RedshardError::Incomplete)
            } else {
                Err(RedshardError::Protocol("expected \\n after \\r".into()))
            }
        }
        None => Err(RedshardError::Incomplete),
    }
}

/// Read the line starting at `buf[offset]` up to `\r\n`.
/// Returns `(line_bytes, index_after_crlf)`.
#[inline]
fn read_line(buf: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let cr = find_crlf(buf, offset)?;
    Ok((&buf[offset..cr], cr + 2))
}

/// Parse a signed decimal from a byte slice (no allocations).
fn parse_int_from_bytes(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Err(RedshardError::Protocol("empty integer".into()));
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        b'+' => (false, &bytes[1..]),
        _ => (false, bytes),
    };

    if digits.is_empty() {
        return Err(RedshardError::Protocol("integer has no digits".into()));
    }

    // Accumulate as negative so i64::MIN does not overflow.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RedshardError::Protocol(format!(
                "invalid byte in integer: 0x{b:02x}"
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| RedshardError::Protocol("integer overflow".into()))?;
    }

    if negative {
        Ok(n)
    } else {
        n.checked_neg()
            .ok_or_else(|| RedshardError::Protocol("integer overflow".into()))
    }
}

/// Parse the declared length/count of a bulk or multi-bulk header.
///
/// `-1` means nil; any other negative value is malformed.
fn parse_declared_len(line: &[u8], what: &str) -> Result<Option<usize>> {
    match parse_int_from_bytes(line)? {
        -1 => Ok(None),
        n if n < 0 => Err(RedshardError::Protocol(format!(
            "invalid {what} length: {n}"
        ))),
        n => Ok(Some(n as usize)),
    }
}

// ── Type parsers ──────────────────────────────────────────────────

/// `+<string>\r\n`
fn parse_status(buf: &Bytes) -> Result<(Reply, usize)> {
    let (line, next) = read_line(buf, 1)?;
    // Common replies skip UTF-8 validation
    let s = match line {
        b"OK" => "OK".to_string(),
        b"PONG" => "PONG".to_string(),
        b"QUEUED" => "QUEUED".to_string(),
        _ => std::str::from_utf8(line)
            .map_err(|e| RedshardError::Protocol(format!("invalid UTF-8 in status: {e}")))?
            .to_string(),
    };
    Ok((Reply::Status(s), next))
}

/// `-<error message>\r\n`
fn parse_error(buf: &Bytes) -> Result<(Reply, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let s = String::from_utf8_lossy(line).into_owned();
    Ok((Reply::Error(s), next))
}

/// `:<integer>\r\n`
fn parse_integer(buf: &Bytes) -> Result<(Reply, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let i = parse_int_from_bytes(line)?;
    Ok((Reply::Integer(i), next))
}

/// `$<length>\r\n<data>\r\n`  or  `$-1\r\n`
fn parse_bulk(buf: &Bytes) -> Result<(Reply, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let Some(len) = parse_declared_len(line, "bulk")? else {
        return Ok((Reply::Bulk(None), next));
    };

    let data_end = next
        .checked_add(len)
        .ok_or_else(|| RedshardError::Protocol("bulk length overflow".into()))?;
    // Need data + \r\n
    if buf.len() < data_end + 2 {
        return Err(RedshardError::Incomplete);
    }
    if buf[data_end] != b'\r' || buf[data_end + 1] != b'\n' {
        return Err(RedshardError::Protocol(
            "bulk string not terminated by \\r\\n".into(),
        ));
    }

    let data = buf.slice(next..data_end);
    Ok((Reply::Bulk(Some(data)), data_end + 2))
}

/// `*<count>\r\n<elements>`  or  `*-1\r\n`
fn parse_multi_bulk(buf: &Bytes) -> Result<(Reply, usize)> {
    let (line, mut next) = read_line(buf, 1)?;
    let Some(count) = parse_declared_len(line, "multi-bulk")? else {
        return Ok((Reply::MultiBulk(None), next));
    };

    // Every element takes at least 3 bytes; cap the pre-allocation by what
    // could possibly be in the buffer.
    let mut elements = Vec::with_capacity(count.min(buf.len() / 3 + 1));
    for _ in 0..count {
        let sub = buf.slice(next..);
        let (val, consumed) = parse(&sub)?;
        elements.push(val);
        next += consumed;
    }
    Ok((Reply::MultiBulk(Some(elements)), next))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::writer::encode_bulk;

    // ── Status ──

    #[test]
    fn status_ok() {
        let (val, len) = parse_slice(b"+OK\r\n").unwrap();
        assert_eq!(val, Reply::status("OK"));
        assert_eq!(len, 5);
    }

    #[test]
    fn status_empty() {
        let (val, len) = parse_slice(b"+\r\n").unwrap();
        assert_eq!(val, Reply::status(""));
        assert_eq!(len, 3);
    }

    #[test]
    fn status_cut_mid_line() {
        assert!(matches!(
            parse_slice(b"+OK"),
            Err(RedshardError::Incomplete)
        ));
        assert!(matches!(
            parse_slice(b"+OK\r"),
            Err(RedshardError::Incomplete)
        ));
    }

    #[test]
    fn status_bad_terminator() {
        assert!(matches!(
            parse_slice(b"+OK\rX\n"),
            Err(RedshardError::Protocol(_))
        ));
    }

    // ── Error ──

    #[test]
    fn top_level_error_is_server_error() {
        let err = decode(b"-ERR unknown command\r\n").unwrap_err();
        match err {
            RedshardError::Server { message, .. } => assert_eq!(message, "ERR unknown command"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn error_reports_consumed_len() {
        let (val, len) = parse_slice(b"-ERR x\r\n+OK\r\n").unwrap();
        assert_eq!(val, Reply::Error("ERR x".into()));
        assert_eq!(len, 8);
    }

    // ── Integer ──

    #[test]
    fn integers() {
        assert_eq!(decode(b":1000\r\n").unwrap(), Reply::Integer(1000));
        assert_eq!(decode(b":-42\r\n").unwrap(), Reply::Integer(-42));
        assert_eq!(decode(b":0\r\n").unwrap(), Reply::Integer(0));
        assert_eq!(
            decode(b":-9223372036854775808\r\n").unwrap(),
            Reply::Integer(i64::MIN)
        );
    }

    #[test]
    fn integer_overflow() {
        assert!(parse_slice(b":9223372036854775808\r\n").is_err());
    }

    #[test]
    fn integer_malformed() {
        assert!(parse_slice(b":\r\n").is_err());
        assert!(parse_slice(b":-\r\n").is_err());
        assert!(parse_slice(b":12a3\r\n").is_err());
    }

    // ── Bulk ──

    #[test]
    fn bulk() {
        let (val, len) = parse_slice(b"$5\r\nhello\r\n").unwrap();
        assert_eq!(val, Reply::bulk("hello"));
        assert_eq!(len, 11);
    }

    #[test]
    fn bulk_nil_differs_from_empty() {
        assert_eq!(decode(b"$-1\r\n").unwrap(), Reply::Bulk(None));
        assert_eq!(decode(b"$0\r\n\r\n").unwrap(), Reply::bulk(""));
    }

    #[test]
    fn bulk_negative_length_other_than_nil() {
        assert!(matches!(
            parse_slice(b"$-2\r\n"),
            Err(RedshardError::Protocol(_))
        ));
    }

    #[test]
    fn bulk_incomplete() {
        assert!(matches!(
            parse_slice(b"$5\r\nhel"),
            Err(RedshardError::Incomplete)
        ));
        assert!(matches!(
            parse_slice(b"$5\r\nhello"),
            Err(RedshardError::Incomplete)
        ));
    }

    #[test]
    fn bulk_missing_terminator() {
        assert!(matches!(
            parse_slice(b"$5\r\nhelloXX"),
            Err(RedshardError::Protocol(_))
        ));
    }

    #[test]
    fn bulk_roundtrip_binary_payloads() {
        let payloads: [&[u8]; 5] = [
            b"",
            b"plain",
            b"line\r\nbreak",
            &[0, 0, 0],
            &[b'$', b'-', b'1', b'\r', b'\n', 0xff],
        ];
        for payload in payloads {
            let wire = encode_bulk(payload);
            assert_eq!(decode(&wire).unwrap(), Reply::bulk(payload.to_vec()));
        }
    }

    // ── Multi-bulk ──

    #[test]
    fn multi_bulk_nil_differs_from_empty() {
        assert_eq!(decode(b"*-1\r\n").unwrap(), Reply::MultiBulk(None));
        assert_eq!(decode(b"*0\r\n").unwrap(), Reply::MultiBulk(Some(vec![])));
    }

    #[test]
    fn multi_bulk_mixed_types() {
        let input = b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n:3\r\n";
        let (val, len) = parse_slice(input).unwrap();
        assert_eq!(
            val,
            Reply::MultiBulk(Some(vec![
                Reply::bulk("message"),
                Reply::bulk("ch"),
                Reply::Integer(3),
            ]))
        );
        assert_eq!(len, input.len());
    }

    #[test]
    fn multi_bulk_nested_with_nils_and_errors() {
        let input = b"*3\r\n*2\r\n:1\r\n$-1\r\n-ERR bad\r\n*-1\r\n";
        let val = decode(input).unwrap();
        assert_eq!(
            val,
            Reply::MultiBulk(Some(vec![
                Reply::MultiBulk(Some(vec![Reply::Integer(1), Reply::Bulk(None)])),
                Reply::Error("ERR bad".into()),
                Reply::MultiBulk(None),
            ]))
        );
    }

    #[test]
    fn multi_bulk_incomplete_child() {
        assert!(matches!(
            parse_slice(b"*2\r\n$3\r\nfoo\r\n"),
            Err(RedshardError::Incomplete)
        ));
    }

    #[test]
    fn multi_bulk_huge_count_does_not_preallocate() {
        assert!(matches!(
            parse_slice(b"*2147483647\r\n:1\r\n"),
            Err(RedshardError::Incomplete)
        ));
    }

    #[test]
    fn trailing_bytes_are_left_alone() {
        let (val, len) = parse_slice(b"+OK\r\n:1\r\n").unwrap();
        assert_eq!(val, Reply::status("OK"));
        assert_eq!(len, 5);
    }

    // ── Unknown ──

    #[test]
    fn unknown_marker() {
        assert!(matches!(
            parse_slice(b"?what\r\n"),
            Err(RedshardError::Protocol(_))
        ));
        assert!(matches!(parse_slice(b""), Err(RedshardError::Incomplete)));
    }
}
