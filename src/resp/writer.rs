//! RESP command serializer.
//!
//! Encodes commands into the bulk string array wire format:
//! `*<N>\r\n$<len>\r\narg1\r\n$<len>\r\narg2\r\n…`

use crate::resp::command::Command;
use itoa::Buffer;

/// Upper bound of the encoded size of `cmd`.
fn encoded_capacity(cmd: &Command) -> usize {
    let mut cap = 1 + 20 + 2; // '*' + max_digits + \r\n
    cap += 1 + 20 + 2 + cmd.verb().len() + 2;
    for arg in cmd.arguments() {
        cap += 1 + 20 + 2 + arg.len() + 2; // '$' + len + \r\n + data + \r\n
    }
    cap
}

fn write_bulk(buf: &mut Vec<u8>, itoa_buf: &mut Buffer, data: &[u8]) {
    // $<len>\r\n<data>\r\n
    buf.push(b'$');
    buf.extend_from_slice(itoa_buf.format(data.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

fn write_command(buf: &mut Vec<u8>, itoa_buf: &mut Buffer, cmd: &Command) {
    // *<N>\r\n
    buf.push(b'*');
    buf.extend_from_slice(itoa_buf.format(cmd.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");

    write_bulk(buf, itoa_buf, cmd.verb());
    for arg in cmd.arguments() {
        write_bulk(buf, itoa_buf, arg);
    }
}

/// Encode one command into wire format.
///
/// Every element is length-prefixed, so arguments may contain any byte,
/// `\r\n` and `\0` included.
pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_capacity(cmd));
    let mut itoa_buf = Buffer::new();
    write_command(&mut buf, &mut itoa_buf, cmd);
    buf
}

/// Encode multiple commands into a single buffer for pipelined writes.
pub fn encode_pipeline(commands: &[Command]) -> Vec<u8> {
    let cap = commands.iter().map(encoded_capacity).sum();
    let mut buf = Vec::with_capacity(cap);
    let mut itoa_buf = Buffer::new();
    for cmd in commands {
        write_command(&mut buf, &mut itoa_buf, cmd);
    }
    buf
}

/// Encode a single bulk reply frame: `$<len>\r\n<data>\r\n`.
pub fn encode_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 20 + 2 + data.len() + 2);
    write_bulk(&mut buf, &mut Buffer::new(), data);
    buf
}

// ── Tests ──────────────────────────────────────────────────────────
