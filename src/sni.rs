//! TLS ClientHello parsing for SNI-based connection routing.
//!
//! Decodes just enough of a TLS record to pull the server_name extension out
//! of a ClientHello, without terminating the connection. The input is the
//! initial peek of the stream, so a record that extends past the peeked bytes
//! is reported as not-TLS.

const RECORD_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const SNI_TYPE_HOSTNAME: u8 = 0;

/// Legacy version range accepted in the ClientHello body. TLS 1.3 encodes
/// itself as TLS 1.2 here and negotiates upward via supported_versions.
const VERSION_TLS10: u16 = 0x0301;
const VERSION_TLS12: u16 = 0x0303;

/// Bounds-checked reader over a byte slice, in the spirit of the
/// length-prefixed TLS presentation language. Every read either consumes
/// from the front or fails; nothing ever indexes past the input.
struct Bytes<'a>(&'a [u8]);

impl<'a> Bytes<'a> {
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn read_u8(&mut self) -> Option<u8> {
        let (&v, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(v)
    }

    fn read_u16(&mut self) -> Option<u16> {
        let b = self.0.get(..2)?;
        let v = u16::from_be_bytes([b[0], b[1]]);
        self.0 = &self.0[2..];
        Some(v)
    }

    fn read_u24(&mut self) -> Option<usize> {
        let b = self.0.get(..3)?;
        let v = (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]);
        self.0 = &self.0[3..];
        Some(v)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.0 = self.0.get(n..)?;
        Some(())
    }

    fn read_bytes(&mut self, n: usize) -> Option<Bytes<'a>> {
        let taken = self.0.get(..n)?;
        self.0 = &self.0[n..];
        Some(Bytes(taken))
    }

    fn read_u8_length_prefixed(&mut self) -> Option<Bytes<'a>> {
        let n = self.read_u8()?;
        self.read_bytes(usize::from(n))
    }

    fn read_u16_length_prefixed(&mut self) -> Option<Bytes<'a>> {
        let n = self.read_u16()?;
        self.read_bytes(usize::from(n))
    }

    fn read_u24_length_prefixed(&mut self) -> Option<Bytes<'a>> {
        let n = self.read_u24()?;
        self.read_bytes(n)
    }
}

/// Tries to parse a TLS record and extract the SNI.
///
/// Returns the parsed SNI and whether the message looks like TLS. Even if no
/// server_name extension is present the record may still be well-formed TLS,
/// in which case the name is empty and the flag is true. The returned name is
/// an owned copy; nothing borrows from `record` after return.
pub fn parse_client_hello(record: &[u8]) -> (String, bool) {
    let mut input = Bytes(record);

    // Record header: content type, legacy version (ignored), fragment.
    let mut fragment = match (|| {
        if input.read_u8()? != RECORD_TYPE_HANDSHAKE {
            return None;
        }
        input.skip(2)?;
        input.read_u16_length_prefixed()
    })() {
        Some(fragment) => fragment,
        None => return (String::new(), false),
    };

    // Handshake message framing and the fixed-size ClientHello prefix.
    let mut extensions = match (|| {
        if fragment.read_u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
            return None;
        }
        let mut client_hello = fragment.read_u24_length_prefixed()?;
        let version = client_hello.read_u16()?;
        if !(VERSION_TLS10..=VERSION_TLS12).contains(&version) {
            return None;
        }
        client_hello.skip(32)?; // random
        client_hello.read_u8_length_prefixed()?; // session id
        client_hello.read_u16_length_prefixed()?; // cipher suites
        client_hello.read_u8_length_prefixed()?; // compression methods
        client_hello.read_u16_length_prefixed()
    })() {
        Some(extensions) => extensions,
        None => return (String::new(), false),
    };

    let mut server_name = None;
    let mut seen_server_name = false;
    while !extensions.is_empty() {
        let (ext_type, ext_data) = match (|| {
            let ext_type = extensions.read_u16()?;
            let ext_data = extensions.read_u16_length_prefixed()?;
            Some((ext_type, ext_data))
        })() {
            Some(ext) => ext,
            None => return (String::new(), false),
        };
        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }
        // A second server_name extension is a protocol violation; drop the
        // name but keep the looks-like-TLS verdict.
        if seen_server_name {
            return (String::new(), true);
        }
        seen_server_name = true;
        server_name = parse_server_name_list(ext_data);
    }

    match server_name {
        Some(name) => (name, true),
        None => (String::new(), true),
    }
}

/// Walks the server_name_list, returning the first hostname entry. Entries
/// with other name types are skipped whole. Malformed lists yield no name;
/// the record framing has already been validated by the caller.
fn parse_server_name_list(mut ext_data: Bytes<'_>) -> Option<String> {
    let mut list = ext_data.read_u16_length_prefixed()?;
    while !list.is_empty() {
        let name_type = list.read_u8()?;
        let value = list.read_u16_length_prefixed()?;
        if name_type == SNI_TYPE_HOSTNAME {
            return String::from_utf8(value.0.to_vec()).ok();
        }
    }
    None
}
