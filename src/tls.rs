//! TLS ClientHello parsing, just far enough to reach the server_name extension.
//!
//! Works on a single TCP payload: a ClientHello split across segments is not
//! reassembled and simply yields no SNI. Every length is bounds-checked and any
//! failure ends the parse with `None`.
//!
//! ```text
//! record:       type(1)=0x16 | version(2) | length(2)
//! handshake:    type(1)=0x01 | length(3)
//! client_hello: version(2) | random(32) | session_id<1> | cipher_suites<2>
//!               | compression_methods<1> | extensions<2>
//! server_name:  list<2> { name_type(1) | host_name<2> }*
//! ```

pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
pub const EXTENSION_SERVER_NAME: u16 = 0x0000;
pub const NAME_TYPE_HOST_NAME: u8 = 0x00;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const RANDOM_LEN: usize = 32;

/// Forward-only cursor over a borrowed buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    fn u8_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()?;
        self.take(usize::from(len))
    }

    fn u16_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }
}

/// Borrowed view of a ClientHello. Fields other than the extensions are only
/// delimited, never validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHello<'a> {
    pub version: u16,
    pub random: &'a [u8],
    pub session_id: &'a [u8],
    pub cipher_suites: &'a [u8],
    pub compression_methods: &'a [u8],
    /// Raw extension block, empty when the hello carries none.
    pub extensions: &'a [u8],
}

impl<'a> ClientHello<'a> {
    /// Parses a TCP payload that should start with a TLS handshake record.
    pub fn from_record(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < RECORD_HEADER_LEN || payload[0] != CONTENT_TYPE_HANDSHAKE {
            return None;
        }

        let mut handshake = Reader::new(&payload[RECORD_HEADER_LEN..]);
        if handshake.remaining() < HANDSHAKE_HEADER_LEN || handshake.u8()? != HANDSHAKE_CLIENT_HELLO {
            return None;
        }
        let body_len = handshake.u24()?;
        Self::parse_body(handshake.take(body_len)?)
    }

    /// Parses the ClientHello body that follows the 4-byte handshake header.
    pub fn parse_body(body: &'a [u8]) -> Option<Self> {
        let mut reader = Reader::new(body);
        let version = reader.u16()?;
        let random = reader.take(RANDOM_LEN)?;
        let session_id = reader.u8_prefixed()?;
        let cipher_suites = reader.u16_prefixed()?;
        let compression_methods = reader.u8_prefixed()?;
        let extensions = if reader.remaining() == 0 {
            &[][..]
        } else {
            reader.u16_prefixed()?
        };

        Some(Self {
            version,
            random,
            session_id,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }

    pub fn extensions(&self) -> Extensions<'a> {
        Extensions {
            reader: Reader::new(self.extensions),
        }
    }

    /// First host_name entry of the server_name extension.
    pub fn server_name(&self) -> Option<&'a str> {
        let (_, data) = self
            .extensions()
            .find(|(kind, _)| *kind == EXTENSION_SERVER_NAME)?;
        server_names(data)
            .filter(|(name_type, _)| *name_type == NAME_TYPE_HOST_NAME)
            .find_map(|(_, name)| std::str::from_utf8(name).ok().filter(|s| !s.is_empty()))
    }
}

/// Iterator over `(extension_type, extension_data)`; stops at the first
/// extension whose declared length overruns the block.
pub struct Extensions<'a> {
    reader: Reader<'a>,
}

impl<'a> Iterator for Extensions<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.remaining() < 4 {
            return None;
        }
        let kind = self.reader.u16()?;
        let data = self.reader.u16_prefixed()?;
        Some((kind, data))
    }
}

/// Entries of a server_name extension body as `(name_type, name)`.
pub fn server_names(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut list = Reader::new(data)
        .u16_prefixed()
        .map(Reader::new)
        .unwrap_or_else(|| Reader::new(&[]));

    std::iter::from_fn(move || {
        if list.remaining() < 3 {
            return None;
        }
        let name_type = list.u8()?;
        let name = list.u16_prefixed()?;
        Some((name_type, name))
    })
}

/// SNI hostname carried by a TCP payload, if it holds a complete ClientHello.
pub fn extract_sni(payload: &[u8]) -> Option<&str> {
    ClientHello::from_record(payload)?.server_name()
}
