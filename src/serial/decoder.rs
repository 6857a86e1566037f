/// Incremental UTF-8 decoder for chunked serial reads.
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // incomplete sequence at the end, wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ascii() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"OK\n"), "OK\n");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_split_multibyte_char() {
        let bytes = "temp: 21\u{00B0}C".as_bytes();
        let split = bytes.len() - 2; // inside the two-byte degree sign
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&bytes[..split]), "temp: 21");
        assert!(decoder.has_pending());
        assert_eq!(decoder.decode(&bytes[split..]), "\u{00B0}C");
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_invalid_byte_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }
}
