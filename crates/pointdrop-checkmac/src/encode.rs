//! Gateway URL encoding.
//!
//! The gateway hashes a form-style encoding of the raw signing string. It differs
//! from RFC 3986 percent-encoding: space becomes `+`, the characters `-_.!*()`
//! are left as-is, and the entire result is lowercased (so escapes use lowercase
//! hex). Any deviation produces a different `CheckMacValue`.

/// Bytes that pass through unescaped besides ASCII alphanumerics.
const UNRESERVED: &[u8] = b"-_.!*()";

/// Encodes `input` with the gateway's table and lowercases the result.
pub fn gateway_url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for &byte in input.as_bytes() {
        if byte.is_ascii_alphanumeric() || UNRESERVED.contains(&byte) {
            out.push(byte.to_ascii_lowercase() as char);
        } else if byte == b' ' {
            out.push('+');
        } else {
            out.push('%');
            out.push_str(&format!("{:02x}", byte));
        }
    }
    out
}
