//! Text decoding quirks of stored messages
//!
//! - Alphanumeric senders arrive as hex of GSM 7-bit packed text.
//! - Unicode bodies arrive as hex of UTF-16BE.

/// GSM 03.38 default alphabet
const GSM7_BASIC: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å', //
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{1b}', 'Æ', 'æ', 'ß', 'É', //
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', //
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', //
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', //
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§', //
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', //
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à', //
];

const GSM7_ESCAPE: u8 = 0x1B;

fn gsm7_extension(septet: u8) -> Option<char> {
    match septet {
        0x0A => Some('\u{0c}'),
        0x14 => Some('^'),
        0x28 => Some('{'),
        0x29 => Some('}'),
        0x2F => Some('\\'),
        0x3C => Some('['),
        0x3D => Some('~'),
        0x3E => Some(']'),
        0x40 => Some('|'),
        0x65 => Some('€'),
        _ => None,
    }
}

/// Check for a non-empty string of hex digits
pub fn is_hex(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decode a hex string into bytes
///
/// Returns None for odd lengths or non-hex characters.
pub fn hex_to_bytes(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Unpack GSM 7-bit packed septets
pub fn unpack_septets(packed: &[u8]) -> Vec<u8> {
    let count = packed.len() * 8 / 7;
    let mut septets: Vec<u8> = (0..count)
        .map(|i| {
            let bit = i * 7;
            let lo = packed[bit / 8] as u16;
            let hi = packed.get(bit / 8 + 1).copied().unwrap_or(0) as u16;
            (((lo | (hi << 8)) >> (bit % 8)) & 0x7F) as u8
        })
        .collect();

    // Seven octets carry eight septets; a zero eighth one is padding
    if packed.len() % 7 == 0 && septets.last() == Some(&0) {
        septets.pop();
    }
    septets
}

/// Map septets through the default alphabet and its extension table
pub fn septets_to_string(septets: &[u8]) -> String {
    let mut text = String::with_capacity(septets.len());
    let mut iter = septets.iter().copied();
    while let Some(septet) = iter.next() {
        if septet == GSM7_ESCAPE {
            match iter.next().and_then(gsm7_extension) {
                Some(c) => text.push(c),
                None => text.push(' '),
            }
        } else {
            text.push(GSM7_BASIC[(septet & 0x7F) as usize]);
        }
    }
    text
}

/// Decode hex of GSM 7-bit packed text
pub fn decode_gsm7_hex(text: &str) -> Option<String> {
    let packed = hex_to_bytes(text)?;
    Some(septets_to_string(&unpack_septets(&packed)))
}

/// Decode hex of UTF-16BE text
///
/// Returns None for an odd byte count or unpaired surrogates.
pub fn decode_utf16_hex(text: &str) -> Option<String> {
    let bytes = hex_to_bytes(text)?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

/// Decode the sender field of a stored message
///
/// Numbers in international (`+`) or trunk (`0`) form are kept. Anything
/// else that looks like hex of whole octets is GSM 7-bit packed text.
pub fn decode_sender(sender: &str) -> String {
    if sender.starts_with('+') || sender.starts_with('0') {
        return sender.to_string();
    }
    if is_hex(sender) && sender.len() % 2 == 0 {
        if let Some(decoded) = decode_gsm7_hex(sender) {
            return decoded;
        }
    }
    sender.to_string()
}

/// Decode a message body
///
/// Hex text of even length whose length disagrees with the declared size is
/// taken to be UTF-16BE. A missing size always disagrees. If decoding fails
/// the text is kept as received.
pub fn decode_body(body: &str, declared_size: Option<usize>) -> String {
    let looks_encoded =
        body.len() % 2 == 0 && is_hex(body) && declared_size != Some(body.len());
    if !looks_encoded {
        return body.to_string();
    }

    match decode_utf16_hex(body) {
        Some(decoded) => decoded,
        None => {
            log::warn!("Undecodable UTF-16 body in SMS, keeping raw text");
            body.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_bytes() {
        assert_eq!(hex_to_bytes("00fF10"), Some(vec![0x00, 0xFF, 0x10]));
        assert_eq!(hex_to_bytes("ABC"), None);
        assert_eq!(hex_to_bytes("ZZ"), None);
    }

    #[test]
    fn test_decode_gsm7() {
        assert_eq!(decode_gsm7_hex("E8329BFD4697D9EC37").unwrap(), "hellohello");
        assert_eq!(decode_gsm7_hex("D4F29C0E").unwrap(), "Test");
    }

    #[test]
    fn test_septet_extension_table() {
        assert_eq!(septets_to_string(&[0x1B, 0x65, 0x35]), "€5");
        assert_eq!(septets_to_string(&[0x1B, 0x01]), " ");
    }

    #[test]
    fn test_decode_sender() {
        assert_eq!(decode_sender("+15550001234"), "+15550001234");
        assert_eq!(decode_sender("0501234567"), "0501234567");
        assert_eq!(decode_sender("D4F29C0E"), "Test");
        // Odd length is left alone
        assert_eq!(decode_sender("15550001234"), "15550001234");
        assert_eq!(decode_sender("Unknown"), "Unknown");
    }

    #[test]
    fn test_decode_utf16_body() {
        assert_eq!(decode_body("00480069", None), "Hi");
        assert_eq!(decode_body("05E905DC05D505DD", Some(4)), "שלום");
    }

    #[test]
    fn test_body_with_matching_size_is_plain() {
        assert_eq!(decode_body("CAFE", Some(4)), "CAFE");
        assert_eq!(decode_body("Hello", Some(5)), "Hello");
    }

    #[test]
    fn test_body_heuristic_false_positive() {
        // Hex-looking plain text without a declared size is decoded anyway
        assert_eq!(decode_body("CAFE", None), "\u{CAFE}");
    }

    #[test]
    fn test_undecodable_body_is_kept() {
        // Five octets cannot be UTF-16
        assert_eq!(decode_body("48656C6C6F", None), "48656C6C6F");
        // Lone high surrogate
        assert_eq!(decode_body("D800", None), "D800");
    }
}
