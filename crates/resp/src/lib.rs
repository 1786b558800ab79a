//! RESP wire format support for the proxy: an incremental request parser
//! which splits pipelined commands, and a reply scanner which locates
//! complete reply frames so their raw bytes can be relayed untouched.

mod reply;
mod request;

pub use reply::reply_frame_len;
pub use request::{Mode, RequestFrame, RequestParser};

use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("expected '$' before bulk argument")]
    MissingBulkHeader,
    #[error("malformed frame terminator")]
    BadTerminator,
    #[error("invalid reply type byte {0:#04x}")]
    BadReplyType(u8),
    #[error("malformed integer in frame header")]
    BadInteger,
}

/// Encode a single-line error frame exactly as it goes on the wire.
pub fn error_frame(msg: &str) -> Bytes {
    let mut out = Vec::with_capacity(msg.len() + 3);
    out.push(b'-');
    out.extend_from_slice(msg.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.into()
}

/// Encode `args` as one multi-bulk command.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_frame() {
        assert_eq!(&error_frame("Invalid request")[..], b"-Invalid request\r\n");
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(
            encode_command(&[b"AUTH", b"s3cret"]),
            b"*2\r\n$4\r\nAUTH\r\n$6\r\ns3cret\r\n".to_vec()
        );
    }
}
