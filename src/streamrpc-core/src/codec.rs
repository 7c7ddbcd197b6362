/// Message serialization used by the clients.
pub trait Codec: Clone + Sync + Send + 'static {
    /// Media type announced in `Content-Type` on HTTP requests.
    fn content_type(&self) -> &'static str;

    fn encode<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>>;
    fn decode<T: serde::de::DeserializeOwned>(&self, data: &[u8]) -> anyhow::Result<T>;
}

pub mod json {
    use crate::codec::Codec;
    use serde::Serialize;
    use serde::de::DeserializeOwned;
    use serde_json::Value;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct JsonCodec;

    impl JsonCodec {
        pub fn new() -> Self {
            Self
        }
    }

    impl Codec for JsonCodec {
        fn content_type(&self) -> &'static str {
            "application/json"
        }

        fn encode<T: Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>> {
            let json = serde_json::to_vec(value)?;
            Ok(json)
        }

        fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> anyhow::Result<T> {
            let val = serde_json::from_slice(data)?;
            Ok(val)
        }
    }

    /// Incremental decoder for a byte stream of concatenated JSON values.
    ///
    /// Chunks may split a value anywhere; the incomplete tail is kept until
    /// the next chunk completes it. Values are only delimited by their own
    /// syntax, there is no framing. Bytes are scanned once: nesting depth and
    /// string state carry over between chunks, and serde_json only sees a
    /// value once its closing byte has arrived.
    #[derive(Debug, Default)]
    pub struct ValueDecoder {
        buf: Vec<u8>,
        scanned: usize,
        depth: usize,
        in_string: bool,
        escaped: bool,
    }

    fn is_delimiter(byte: u8) -> bool {
        byte.is_ascii_whitespace() || b"{}[]\",:".contains(&byte)
    }

    impl ValueDecoder {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of bytes waiting for the rest of a value.
        pub fn buffered(&self) -> usize {
            self.buf.len()
        }

        fn reset(&mut self) {
            *self = Self::default();
        }

        /// Feeds one chunk, handing every complete top-level value to
        /// `on_value` in stream order.
        ///
        /// On a syntax error the values decoded before it have already been
        /// delivered, the buffered bytes are discarded and the error returned.
        pub fn feed<F>(&mut self, chunk: &[u8], mut on_value: F) -> Result<(), serde_json::Error>
        where
            F: FnMut(Value),
        {
            self.buf.extend_from_slice(chunk);

            let mut start = 0;
            let mut pos = self.scanned;
            while pos < self.buf.len() {
                let byte = self.buf[pos];
                pos += 1;

                let end = if self.in_string {
                    match byte {
                        _ if self.escaped => {
                            self.escaped = false;
                            None
                        }
                        b'\\' => {
                            self.escaped = true;
                            None
                        }
                        b'"' => {
                            self.in_string = false;
                            (self.depth == 0).then_some(pos)
                        }
                        _ => None,
                    }
                } else {
                    match byte {
                        b'"' => {
                            self.in_string = true;
                            None
                        }
                        b'{' | b'[' => {
                            self.depth += 1;
                            None
                        }
                        b'}' | b']' if self.depth > 0 => {
                            self.depth -= 1;
                            (self.depth == 0).then_some(pos)
                        }
                        // stray closer, serde_json reports it below
                        b'}' | b']' => Some(pos),
                        _ if self.depth > 0 => None,
                        _ if byte.is_ascii_whitespace() => {
                            if start == pos - 1 {
                                start = pos;
                            }
                            None
                        }
                        // top-level scalar, ends at the next delimiter
                        _ => match self.buf[pos..].iter().position(|b| is_delimiter(*b)) {
                            Some(len) => {
                                pos += len;
                                Some(pos)
                            }
                            None => {
                                pos -= 1;
                                break;
                            }
                        },
                    }
                };

                if let Some(end) = end {
                    match serde_json::from_slice::<Value>(&self.buf[start..end]) {
                        Ok(value) => {
                            on_value(value);
                            start = end;
                        }
                        Err(e) => {
                            self.reset();
                            return Err(e);
                        }
                    }
                }
            }

            self.buf.drain(..start);
            self.scanned = pos - start;
            Ok(())
        }
    }

}
