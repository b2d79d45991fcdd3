use base64::{engine::general_purpose, Engine as _};

const BEGIN_CERTIFICATE: &str = "-----BEGIN CERTIFICATE-----";
const END_CERTIFICATE: &str = "-----END CERTIFICATE-----";
const LINE_WIDTH: usize = 64;

/// Renders DER certificate bytes as a PEM block, base64 wrapped at 64 columns.
pub fn encode_certificate(der: &[u8]) -> String {
    let encoded = general_purpose::STANDARD.encode(der);

    let mut pem = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH + 64);
    pem.push_str(BEGIN_CERTIFICATE);
    pem.push('\n');
    // base64 output is pure ASCII, so chunking bytes never splits a char.
    for line in encoded.as_bytes().chunks(LINE_WIDTH) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(END_CERTIFICATE);
    pem.push('\n');
    pem
}

/// Inverse of [`encode_certificate`]; `None` unless `text` holds exactly one
/// certificate block.
pub fn decode_certificate(text: &str) -> Option<Vec<u8>> {
    let body = text
        .trim()
        .strip_prefix(BEGIN_CERTIFICATE)?
        .strip_suffix(END_CERTIFICATE)?;
    let joined: String = body.split_whitespace().collect();
    general_purpose::STANDARD.decode(joined).ok()
}
