//! NETASCII line ending conversion (RFC 1350, RFC 854).
//!
//! On the wire every line ends in CR LF and a carriage return that is not
//! part of a line ending travels as CR NUL. Locally lines end in LF. Both
//! converters are streaming: input may be split at any byte, including
//! between a CR and the byte after it.

/// Local text to NETASCII.
#[derive(Debug, Default)]
pub struct NetasciiEncoder {
    pending_cr: bool,
}

impl NetasciiEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len() + input.len() / 64);
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    // local CR LF is already a network line ending
                    out.push(b'\n');
                    continue;
                }
                out.push(0);
            }
            match byte {
                b'\n' => out.extend_from_slice(b"\r\n"),
                b'\r' => {
                    out.push(b'\r');
                    self.pending_cr = true;
                }
                _ => out.push(byte),
            }
        }
    }

    /// Flushes a trailing bare CR.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.pending_cr) {
            out.push(0);
        }
    }
}

/// NETASCII to local text.
#[derive(Debug, Default)]
pub struct NetasciiDecoder {
    pending_cr: bool,
}

impl NetasciiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    b'\n' => {
                        out.push(b'\n');
                        continue;
                    }
                    0 => {
                        out.push(b'\r');
                        continue;
                    }
                    // malformed: keep the CR as sent
                    _ => out.push(b'\r'),
                }
            }
            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(byte);
            }
        }
    }

    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if std::mem::take(&mut self.pending_cr) {
            out.push(b'\r');
        }
    }
}
