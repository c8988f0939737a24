//! Minimal RESP codec: command encoding and a resumable reply parser.
//!
//! [`parse_one`] is pure. It never touches a socket; the client feeds it a
//! growing buffer and calls it again whenever it reports an incomplete value.

use std::fmt;

/// Maximum array nesting accepted from the backend.
const MAX_DEPTH: usize = 32;

/// A decoded reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`. A value, not a parse failure.
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$3\r\nfoo\r\n`, or `$-1\r\n` for null.
    Bulk(Option<Vec<u8>>),
    /// `*2\r\n...`, or `*-1\r\n` for null.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// True for the `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Simple(s) if s == "OK")
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Bulk(None) | Self::Array(None))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(s) => write!(f, "+{s}"),
            Self::Error(e) => write!(f, "-{e}"),
            Self::Integer(n) => write!(f, ":{n}"),
            Self::Bulk(None) | Self::Array(None) => f.write_str("(nil)"),
            Self::Bulk(Some(b)) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            Self::Array(Some(items)) => write!(f, "[{} items]", items.len()),
        }
    }
}

/// Bytes that can never become a valid reply, however many more arrive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown reply type byte 0x{0:02x}")]
    UnknownType(u8),
    #[error("invalid length header '{0}'")]
    InvalidLength(String),
    #[error("invalid integer reply '{0}'")]
    InvalidInteger(String),
    #[error("bulk string payload not terminated by CRLF")]
    MissingTerminator,
    #[error("reply nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

/// Encode a command as an array of bulk strings.
pub fn encode_command<P: AsRef<[u8]>>(parts: &[P]) -> Vec<u8> {
    let payload: usize = parts.iter().map(|p| p.as_ref().len() + 16).sum();
    let mut out = Vec::with_capacity(payload + 16);
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        let bytes = part.as_ref();
        out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
        out.extend_from_slice(bytes);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parse one reply starting at `offset`.
///
/// Returns `Ok(None)` when the buffer ends before the value does; the caller
/// should read more bytes and call again with the same offset.
pub fn parse_one(buf: &[u8], offset: usize) -> Result<Option<(Reply, usize)>, ProtocolError> {
    parse_at(buf, offset, 0)
}

fn parse_at(
    buf: &[u8],
    offset: usize,
    depth: usize,
) -> Result<Option<(Reply, usize)>, ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::TooDeep);
    }
    let Some(&tag) = buf.get(offset) else {
        return Ok(None);
    };
    if !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(ProtocolError::UnknownType(tag));
    }
    let Some((line, next)) = read_line(buf, offset + 1) else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((Reply::Simple(lossy(line)), next))),
        b'-' => Ok(Some((Reply::Error(lossy(line)), next))),
        b':' => {
            let n = parse_int(line).ok_or_else(|| ProtocolError::InvalidInteger(lossy(line)))?;
            Ok(Some((Reply::Integer(n), next)))
        }
        b'$' => {
            let Some(len) = parse_length(line)? else {
                return Ok(Some((Reply::Bulk(None), next)));
            };
            let end = next.saturating_add(len);
            if buf.len() < end.saturating_add(2) {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(ProtocolError::MissingTerminator);
            }
            Ok(Some((Reply::Bulk(Some(buf[next..end].to_vec())), end + 2)))
        }
        _ => {
            let Some(count) = parse_length(line)? else {
                return Ok(Some((Reply::Array(None), next)));
            };
            let mut items = Vec::with_capacity(count.min(64));
            let mut cursor = next;
            for _ in 0..count {
                match parse_at(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), cursor)))
        }
    }
}

/// Find the CRLF-terminated line starting at `start`.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let pos = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..pos], start + pos + 2))
}

/// `-1` means null; anything below that is malformed.
fn parse_length(line: &[u8]) -> Result<Option<usize>, ProtocolError> {
    match parse_int(line) {
        Some(-1) => Ok(None),
        Some(n) if n >= 0 => Ok(Some(n as usize)),
        _ => Err(ProtocolError::InvalidLength(lossy(line))),
    }
}

fn parse_int(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}
