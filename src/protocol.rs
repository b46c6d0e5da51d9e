//! Line protocol spoken between the server and its clients.
//!
//! Every message is a single `\n` terminated line of text.
//!
//! ```text
//! S: SUCC                       (or "ERR: ..." followed by close)
//! C: ping
//! S: Processing request...
//! S: (Echo) ping
//! S:                            (blank line ends the response)
//! C: quit
//! S: Processing request...
//! ```

use bytes::{BufMut, BytesMut};

/// Handshake token sent when a connection is admitted.
pub const ADMITTED: &str = "SUCC";

/// Handshake line sent when the server is at capacity.
///
/// Clients only look for the `ERR` token; the rest is for humans.
pub const REJECTED: &str = "ERR: Server is handling too many clients, please connect later!";

/// Interim line written for every request line received.
pub const PROCESSING: &str = "Processing request...";

/// Request line that ends a session.
pub const QUIT: &str = "quit";

/// Encode a single protocol line.
pub fn line(text: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(b'\n');
    buf
}

/// Encode a response line followed by the blank end-of-response line.
pub fn response(text: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(text.len() + 2);
    buf.put_slice(text.as_bytes());
    buf.put_slice(b"\n\n");
    buf
}

/// Strip the line terminator (`\n` or `\r\n`) from a line read off the wire.
pub fn trim_line(raw: &str) -> &str {
    let line = raw.strip_suffix('\n').unwrap_or(raw);
    line.strip_suffix('\r').unwrap_or(line)
}
