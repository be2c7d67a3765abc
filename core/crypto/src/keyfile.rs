//! Keyfile interpretation.
//!
//! Accepted formats, tried in this order:
//! - XML keyfile version 1.0 (base64 `<Data>`) or 2.0 (hex `<Data Hash="..">`)
//! - exactly 32 raw bytes
//! - exactly 64 hexadecimal characters
//! - anything else: SHA-256 of the whole file

use base64::{engine::general_purpose::STANDARD, Engine as _};
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};

use crate::keys::KEY_LENGTH;
use passvault_common::{Error, Result};

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidCredentialsFormat(msg.into())
}

/// Turn keyfile bytes into a 32-byte key component.
pub fn key_from_bytes(data: &[u8]) -> Result<[u8; KEY_LENGTH]> {
    if data.is_empty() {
        return Err(invalid("Keyfile is empty"));
    }

    if looks_like_xml(data) {
        return parse_xml_keyfile(data);
    }

    if data.len() == KEY_LENGTH {
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(data);
        return Ok(key);
    }

    if data.len() == KEY_LENGTH * 2 && data.iter().all(u8::is_ascii_hexdigit) {
        let mut key = [0u8; KEY_LENGTH];
        hex::decode_to_slice(data, &mut key).map_err(|e| invalid(e.to_string()))?;
        return Ok(key);
    }

    Ok(Sha256::digest(data).into())
}

fn looks_like_xml(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let trimmed = &data[start..];
    let trimmed = trimmed.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(trimmed);
    trimmed.starts_with(b"<?xml") || trimmed.starts_with(b"<KeyFile")
}

fn parse_xml_keyfile(data: &[u8]) -> Result<[u8; KEY_LENGTH]> {
    let text = std::str::from_utf8(data).map_err(|_| invalid("Keyfile is not valid UTF-8"))?;
    let text = text.trim_start_matches('\u{feff}');

    let mut reader = Reader::from_str(text);
    let mut path: Vec<String> = Vec::new();
    let mut saw_root = false;
    let mut version: Option<String> = None;
    let mut key_data: Option<String> = None;
    let mut hash_attr: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if path.is_empty() {
                    if name != "KeyFile" {
                        return Err(invalid(format!("Unexpected keyfile root element <{}>", name)));
                    }
                    saw_root = true;
                }
                if name == "Data" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"Hash" {
                            let value = attr
                                .unescape_value()
                                .map_err(|e| invalid(format!("Keyfile XML: {}", e)))?;
                            hash_attr = Some(value.into_owned());
                        }
                    }
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let value = t
                    .unescape()
                    .map_err(|e| invalid(format!("Keyfile XML: {}", e)))?
                    .into_owned();
                match path.join("/").as_str() {
                    "KeyFile/Meta/Version" => version = Some(value.trim().to_string()),
                    "KeyFile/Key/Data" => key_data = Some(value),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(invalid(format!("Keyfile XML: {}", e))),
            _ => {}
        }
    }

    if !saw_root {
        return Err(invalid("Keyfile XML has no <KeyFile> root"));
    }
    let key_data = key_data.ok_or_else(|| invalid("Keyfile XML has no <Key><Data> element"))?;
    let version = version.unwrap_or_else(|| "1.0".to_string());

    let bytes = if version.starts_with("2.") {
        let compact: String = key_data.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(&compact).map_err(|_| invalid("Keyfile data is not valid hex"))?;
        if let Some(expected) = hash_attr {
            let digest = Sha256::digest(&bytes);
            if !hex::encode(&digest[..4]).eq_ignore_ascii_case(expected.trim()) {
                return Err(invalid("Keyfile checksum mismatch"));
            }
        }
        bytes
    } else if version.starts_with("1.") {
        STANDARD
            .decode(key_data.trim())
            .map_err(|_| invalid("Keyfile data is not valid base64"))?
    } else {
        return Err(invalid(format!("Unsupported keyfile version {}", version)));
    };

    if bytes.len() == KEY_LENGTH {
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(key)
    } else {
        Ok(Sha256::digest(&bytes).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2_KEYFILE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<KeyFile>
    <Meta>
        <Version>2.0</Version>
    </Meta>
    <Key>
        <Data Hash="HASH">
            00112233 44556677 8899AABB CCDDEEFF
            00112233 44556677 8899AABB CCDDEEFF
        </Data>
    </Key>
</KeyFile>"#;

    fn v2_bytes() -> [u8; 32] {
        let mut key = [0u8; 32];
        hex::decode_to_slice(
            "00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFF",
            &mut key,
        )
        .unwrap();
        key
    }

    #[test]
    fn test_raw_32_byte_keyfile() {
        let data = [5u8; 32];
        assert_eq!(key_from_bytes(&data).unwrap(), data);
    }

    #[test]
    fn test_hex_keyfile() {
        let hex_text = "ab".repeat(32);
        assert_eq!(key_from_bytes(hex_text.as_bytes()).unwrap(), [0xAB; 32]);
    }

    #[test]
    fn test_arbitrary_keyfile_is_hashed() {
        let data = b"some random file contents";
        let expected: [u8; 32] = Sha256::digest(data).into();
        assert_eq!(key_from_bytes(data).unwrap(), expected);
    }

    #[test]
    fn test_empty_keyfile_rejected() {
        assert!(matches!(
            key_from_bytes(b""),
            Err(Error::InvalidCredentialsFormat(_))
        ));
    }

    #[test]
    fn test_xml_v1_keyfile() {
        let data = [0x42u8; 32];
        let xml = format!(
            "<?xml version=\"1.0\"?><KeyFile><Meta><Version>1.00</Version></Meta><Key><Data>{}</Data></Key></KeyFile>",
            STANDARD.encode(data)
        );
        assert_eq!(key_from_bytes(xml.as_bytes()).unwrap(), data);
    }

    #[test]
    fn test_xml_v2_keyfile_with_valid_hash() {
        let digest = Sha256::digest(v2_bytes());
        let xml = V2_KEYFILE.replace("HASH", &hex::encode_upper(&digest[..4]));
        assert_eq!(key_from_bytes(xml.as_bytes()).unwrap(), v2_bytes());
    }

    #[test]
    fn test_xml_v2_keyfile_with_bad_hash() {
        let xml = V2_KEYFILE.replace("HASH", "DEADBEEF");
        assert!(matches!(
            key_from_bytes(xml.as_bytes()),
            Err(Error::InvalidCredentialsFormat(_))
        ));
    }

    #[test]
    fn test_xml_keyfile_without_data_rejected() {
        let xml = "<?xml version=\"1.0\"?><KeyFile><Meta><Version>1.00</Version></Meta></KeyFile>";
        assert!(matches!(
            key_from_bytes(xml.as_bytes()),
            Err(Error::InvalidCredentialsFormat(_))
        ));
    }

    #[test]
    fn test_xml_keyfile_bad_base64_rejected() {
        let xml = "<KeyFile><Meta><Version>1.00</Version></Meta><Key><Data>***</Data></Key></KeyFile>";
        assert!(matches!(
            key_from_bytes(xml.as_bytes()),
            Err(Error::InvalidCredentialsFormat(_))
        ));
    }
}
