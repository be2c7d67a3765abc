//! Container load and save.
//!
//! Load runs header → key → integrity → body → payload; save mirrors it
//! with fresh random material (master seed, IV, inner stream key, and for
//! 3.x the stream start bytes) on every call. Output is assembled in memory
//! and only returned whole.

use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

use passvault_common::{CancellationToken, Error, Result};
use passvault_crypto::keys::random_array;
use passvault_crypto::{constant_time_eq, derive_key, CompositeKey, KdfParams, RandomStream, TransformedKey};
use passvault_model::{Compression, Database};

use crate::blocks::{
    header_hmac, read_hashed_blocks, read_hmac_blocks, verify_header_hmac, write_hashed_blocks,
    write_hmac_blocks,
};
use crate::compress::{gunzip, gzip};
use crate::cursor::ByteCursor;
use crate::header::Header;
use crate::inner::InnerHeader;
use crate::xml::{self, XmlFlavor};

/// A transformed key together with the KDF parameters it came from.
///
/// Saving with unchanged parameters reuses it instead of re-running the
/// KDF.
#[derive(Clone)]
pub struct DerivedKey {
    kdf: KdfParams,
    transformed: TransformedKey,
}

impl DerivedKey {
    /// Run the KDF.
    ///
    /// # Errors
    /// - Any error of [`derive_key`]
    pub fn derive(key: &CompositeKey, kdf: &KdfParams, cancel: &CancellationToken) -> Result<Self> {
        Ok(Self {
            kdf: kdf.clone(),
            transformed: derive_key(key, kdf, cancel)?,
        })
    }

    /// Reuse `cached` when it was derived under `kdf`, otherwise derive.
    pub fn reuse_or_derive(
        cached: Option<&DerivedKey>,
        key: &CompositeKey,
        kdf: &KdfParams,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        match cached {
            Some(existing) if existing.kdf == *kdf => {
                debug!("Reusing cached transformed key");
                Ok(existing.clone())
            }
            _ => Self::derive(key, kdf, cancel),
        }
    }

    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }

    pub fn transformed(&self) -> &TransformedKey {
        &self.transformed
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey({}, [REDACTED])", self.kdf.name())
    }
}

/// A successfully opened container.
#[derive(Debug)]
pub struct Opened {
    pub database: Database,
    pub key: DerivedKey,
}

/// Bytes of a sealed container and the key they were sealed with.
#[derive(Debug)]
pub struct Sealed {
    pub bytes: Vec<u8>,
    pub key: DerivedKey,
}

/// Read only the header, e.g. to display settings without credentials.
pub fn read_header(data: &[u8]) -> Result<Header> {
    Header::read(data).map(|(header, _)| header)
}

/// Open and decrypt a container.
///
/// # Preconditions
/// - `cached`, if given, was derived from the same composite key
///
/// # Postconditions
/// - The returned database carries the header's container settings
///
/// # Errors
/// - `MalformedHeader` / `UnsupportedVersion` / `UnsupportedCipher` /
///   `UnsupportedKdf` from the header
/// - `IntegrityCheckFailed` for wrong credentials or any corruption
/// - `MalformedPayload` if the decrypted payload is not a valid document
/// - `OperationCancelled` if `cancel` fires
pub fn open(
    data: &[u8],
    key: &CompositeKey,
    cached: Option<&DerivedKey>,
    cancel: &CancellationToken,
) -> Result<Opened> {
    cancel.check()?;
    let (header, header_len) = Header::read(data)?;
    let raw_header = &data[..header_len];
    let derived = DerivedKey::reuse_or_derive(cached, key, &header.kdf, cancel)?;
    cancel.check()?;

    let database = if header.version.is_kdbx4() {
        open_v4(data, header_len, &header, &derived, cancel)?
    } else {
        open_v3(data, raw_header, &header, &derived, cancel)?
    };

    debug!(
        version = %header.version,
        groups = database.root.all_groups().len(),
        entries = database.root.all_entries().len(),
        "Container opened"
    );
    Ok(Opened {
        database,
        key: derived,
    })
}

fn decompress(compression: Compression, data: Zeroizing<Vec<u8>>) -> Result<Zeroizing<Vec<u8>>> {
    match compression {
        Compression::None => Ok(data),
        Compression::Gzip => Ok(Zeroizing::new(gunzip(&data)?)),
    }
}

fn compress(compression: Compression, data: Zeroizing<Vec<u8>>) -> Result<Zeroizing<Vec<u8>>> {
    match compression {
        Compression::None => Ok(data),
        Compression::Gzip => Ok(Zeroizing::new(gzip(&data)?)),
    }
}

fn open_v4(
    data: &[u8],
    header_len: usize,
    header: &Header,
    derived: &DerivedKey,
    cancel: &CancellationToken,
) -> Result<Database> {
    let raw_header = &data[..header_len];
    let mut cursor = ByteCursor::new(&data[header_len..]);
    let truncated = || Error::MalformedHeader("Header hash or HMAC is truncated".to_string());

    let stored_hash = cursor.take(32).ok_or_else(truncated)?;
    if !constant_time_eq(&Sha256::digest(raw_header), stored_hash) {
        return Err(Error::IntegrityCheckFailed);
    }

    let stored_hmac = cursor.take(32).ok_or_else(truncated)?;
    let hmac_key = derived.transformed.hmac_key(&header.master_seed);
    verify_header_hmac(raw_header, stored_hmac, &hmac_key)?;

    let ciphertext = read_hmac_blocks(cursor.remaining(), &hmac_key, cancel)?;
    let master = derived.transformed.master_key(&header.master_seed);
    let plaintext = Zeroizing::new(header.cipher.decrypt(
        &master,
        &header.encryption_iv,
        &ciphertext,
    )?);
    cancel.check()?;

    let payload = decompress(header.compression, plaintext)?;
    let (inner, xml_offset) = InnerHeader::read(&payload)?;
    let mut stream = RandomStream::new(inner.stream, &inner.stream_key)?;
    let parsed = xml::parse(&payload[xml_offset..], Some(&mut stream), &inner.binaries)?;

    let mut database = parsed.database;
    database.settings = header.settings();
    database.settings.inner_stream = inner.stream;
    Ok(database)
}

fn open_v3(
    data: &[u8],
    raw_header: &[u8],
    header: &Header,
    derived: &DerivedKey,
    cancel: &CancellationToken,
) -> Result<Database> {
    let master = derived.transformed.master_key(&header.master_seed);
    let plaintext = Zeroizing::new(header.cipher.decrypt(
        &master,
        &header.encryption_iv,
        &data[raw_header.len()..],
    )?);
    cancel.check()?;

    let start_bytes = header
        .stream_start_bytes
        .as_ref()
        .ok_or_else(|| Error::MalformedHeader("Missing stream start bytes".to_string()))?;
    if plaintext.len() < start_bytes.len()
        || !constant_time_eq(&plaintext[..start_bytes.len()], start_bytes)
    {
        return Err(Error::IntegrityCheckFailed);
    }

    let joined = Zeroizing::new(read_hashed_blocks(&plaintext[start_bytes.len()..], cancel)?);
    let payload = decompress(header.compression, joined)?;

    let (algorithm, stream_key) = match (&header.inner_stream, &header.protected_stream_key) {
        (Some(algorithm), Some(key)) => (*algorithm, key),
        _ => {
            return Err(Error::MalformedHeader(
                "Missing inner stream settings".to_string(),
            ))
        }
    };
    let mut stream = RandomStream::new(algorithm, stream_key)?;
    let parsed = xml::parse(&payload, Some(&mut stream), &[])?;

    if let Some(stored) = &parsed.header_hash {
        if !constant_time_eq(&Sha256::digest(raw_header), stored) {
            return Err(Error::IntegrityCheckFailed);
        }
    }

    let mut database = parsed.database;
    database.settings = header.settings();
    Ok(database)
}

/// Encrypt a database into container bytes.
///
/// # Postconditions
/// - Fresh master seed, IV and inner stream key were drawn
/// - The KDF ran only if `cached` does not match the database's parameters
///
/// # Errors
/// - `InvalidCredentialsFormat` for an empty composite key
/// - `Crypto` on primitive failures
/// - `OperationCancelled` if `cancel` fires; nothing is returned then
pub fn seal(
    db: &Database,
    key: &CompositeKey,
    cached: Option<&DerivedKey>,
    cancel: &CancellationToken,
) -> Result<Sealed> {
    cancel.check()?;
    let settings = &db.settings;
    let version = settings.effective_version();
    if version != settings.version {
        debug!(
            from = %settings.version,
            to = %version,
            "Promoting container version for KDF"
        );
    }
    let derived = DerivedKey::reuse_or_derive(cached, key, &settings.kdf, cancel)?;
    cancel.check()?;

    let master_seed: [u8; 32] = random_array();
    let encryption_iv = settings.cipher.generate_iv();
    let stream_key = Zeroizing::new(settings.inner_stream.generate_key());
    let mut stream = RandomStream::new(settings.inner_stream, &stream_key)?;
    let master = derived.transformed.master_key(&master_seed);

    let mut header = Header {
        version,
        cipher: settings.cipher,
        compression: settings.compression,
        master_seed,
        encryption_iv,
        kdf: settings.kdf.clone(),
        protected_stream_key: None,
        stream_start_bytes: None,
        inner_stream: None,
        public_custom_data: None,
    };

    let bytes = if version.is_kdbx4() {
        header.public_custom_data = settings.public_custom_data.clone();
        let raw_header = header.to_bytes()?;

        let serialized = xml::serialize(db, Some(&mut stream), XmlFlavor::Kdbx4, None)?;
        let inner = InnerHeader {
            stream: settings.inner_stream,
            stream_key: stream_key.clone(),
            binaries: serialized.binaries,
        };
        let mut payload = inner.to_bytes();
        payload.extend_from_slice(&serialized.xml);
        let payload = compress(settings.compression, payload)?;
        cancel.check()?;

        let ciphertext = settings
            .cipher
            .encrypt(&master, &header.encryption_iv, &payload)?;
        let hmac_key = derived.transformed.hmac_key(&master_seed);

        let mut out = raw_header.clone();
        out.extend_from_slice(&Sha256::digest(&raw_header));
        out.extend_from_slice(&header_hmac(&raw_header, &hmac_key)?);
        out.extend_from_slice(&write_hmac_blocks(&ciphertext, &hmac_key, cancel)?);
        out
    } else {
        let start_bytes: [u8; 32] = random_array();
        header.protected_stream_key = Some(stream_key.to_vec());
        header.stream_start_bytes = Some(start_bytes);
        header.inner_stream = Some(settings.inner_stream);
        let raw_header = header.to_bytes()?;
        let header_hash = Sha256::digest(&raw_header);

        let serialized = xml::serialize(
            db,
            Some(&mut stream),
            XmlFlavor::Kdbx3,
            Some(header_hash.as_slice()),
        )?;
        let payload = compress(settings.compression, Zeroizing::new(serialized.xml))?;
        let blocks = write_hashed_blocks(&payload, cancel)?;

        let mut plaintext = Zeroizing::new(Vec::with_capacity(blocks.len() + 32));
        plaintext.extend_from_slice(&start_bytes);
        plaintext.extend_from_slice(&blocks);
        cancel.check()?;

        let mut out = raw_header;
        out.extend_from_slice(
            &settings
                .cipher
                .encrypt(&master, &header.encryption_iv, &plaintext)?,
        );
        out
    };

    debug!(version = %version, len = bytes.len(), "Container sealed");
    Ok(Sealed {
        bytes,
        key: derived,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use passvault_crypto::{CipherId, InnerStreamAlgorithm};
    use passvault_model::entry::{PASSWORD, TITLE, USERNAME};
    use passvault_model::{Attachment, ContainerSettings, Entry, FormatVersion, Group};

    fn key() -> CompositeKey {
        CompositeKey::from_password(b"correct horse")
    }

    fn sample(settings: ContainerSettings) -> Database {
        let mut db = Database::with_settings("Sample", settings);
        let root = db.root.uuid;
        let group = db.add_group(&root, Group::new("Email")).unwrap();

        let mut entry = Entry::new();
        entry.set(TITLE, "Mailbox");
        entry.set(USERNAME, "user@example.com");
        entry.set_protected(PASSWORD, "s3cret");
        entry.attachments.push(Attachment {
            name: "note.txt".to_string(),
            data: b"attached".to_vec(),
            protected: false,
        });
        let id = db.add_entry(&group, entry).unwrap();
        db.update_entry(&id, |e| e.set_protected(PASSWORD, "n3wer"))
            .unwrap();
        db
    }

    fn fast_aes() -> ContainerSettings {
        ContainerSettings::with_kdf(KdfParams::aes(100))
    }

    fn fast_argon2() -> ContainerSettings {
        ContainerSettings::with_kdf(KdfParams::argon2id(1, 64 * 1024, 1))
    }

    #[test]
    fn test_v4_seal_then_open() {
        let cancel = CancellationToken::new();
        let db = sample(fast_argon2());
        let sealed = seal(&db, &key(), None, &cancel).unwrap();

        let opened = open(&sealed.bytes, &key(), None, &cancel).unwrap();
        assert!(opened.database.content_eq(&db));
        assert_eq!(opened.database.settings, db.settings);
    }

    #[test]
    fn test_v3_seal_then_open() {
        let cancel = CancellationToken::new();
        let mut settings = fast_aes();
        settings.version = FormatVersion::KDBX3_1;
        settings.inner_stream = InnerStreamAlgorithm::Salsa20;
        let db = sample(settings);

        let sealed = seal(&db, &key(), None, &cancel).unwrap();
        assert_eq!(read_header(&sealed.bytes).unwrap().version, FormatVersion::KDBX3_1);

        let opened = open(&sealed.bytes, &key(), None, &cancel).unwrap();
        assert!(opened.database.content_eq(&db));
        assert_eq!(opened.database.settings, db.settings);
    }

    #[test]
    fn test_chacha20_body_uncompressed() {
        let cancel = CancellationToken::new();
        let mut settings = fast_aes();
        settings.cipher = CipherId::ChaCha20;
        settings.compression = Compression::None;
        let db = sample(settings);

        let sealed = seal(&db, &key(), None, &cancel).unwrap();
        let opened = open(&sealed.bytes, &key(), None, &cancel).unwrap();
        assert!(opened.database.content_eq(&db));
    }

    #[test]
    fn test_v3_with_argon2_is_written_as_v4() {
        let cancel = CancellationToken::new();
        let mut settings = fast_argon2();
        settings.version = FormatVersion::KDBX3_1;
        let db = sample(settings);

        let sealed = seal(&db, &key(), None, &cancel).unwrap();
        assert!(read_header(&sealed.bytes).unwrap().version.is_kdbx4());
    }

    #[test]
    fn test_wrong_key_is_integrity_failure() {
        let cancel = CancellationToken::new();
        for settings in [fast_aes(), {
            let mut s = fast_aes();
            s.version = FormatVersion::KDBX3_1;
            s
        }] {
            let sealed = seal(&sample(settings), &key(), None, &cancel).unwrap();
            let wrong = CompositeKey::from_password(b"wrong");
            assert!(matches!(
                open(&sealed.bytes, &wrong, None, &cancel),
                Err(Error::IntegrityCheckFailed)
            ));
        }
    }

    #[test]
    fn test_corrupt_body_byte_is_integrity_failure() {
        let cancel = CancellationToken::new();
        let sealed = seal(&sample(fast_aes()), &key(), None, &cancel).unwrap();
        let mut bytes = sealed.bytes;
        let last = bytes.len() - 50;
        bytes[last] ^= 0x01;
        assert!(matches!(
            open(&bytes, &key(), None, &cancel),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_every_save_uses_fresh_randomness() {
        let cancel = CancellationToken::new();
        let db = sample(fast_aes());
        let first = seal(&db, &key(), None, &cancel).unwrap();
        let second = seal(&db, &key(), Some(&first.key), &cancel).unwrap();

        let h1 = read_header(&first.bytes).unwrap();
        let h2 = read_header(&second.bytes).unwrap();
        assert_ne!(h1.master_seed, h2.master_seed);
        assert_ne!(h1.encryption_iv, h2.encryption_iv);
        assert_eq!(h1.kdf, h2.kdf);
    }

    #[test]
    fn test_cached_key_matches_fresh_derivation() {
        let cancel = CancellationToken::new();
        let db = sample(fast_aes());
        let derived = DerivedKey::derive(&key(), &db.settings.kdf, &cancel).unwrap();
        let sealed = seal(&db, &key(), Some(&derived), &cancel).unwrap();
        assert_eq!(
            sealed.key.transformed().as_bytes(),
            derived.transformed().as_bytes()
        );
        assert!(open(&sealed.bytes, &key(), None, &cancel).is_ok());
    }

    #[test]
    fn test_cancelled_before_kdf() {
        let cancel = CancellationToken::new();
        let sealed = seal(&sample(fast_aes()), &key(), None, &cancel).unwrap();
        cancel.cancel();
        assert!(matches!(
            open(&sealed.bytes, &key(), None, &cancel),
            Err(Error::OperationCancelled)
        ));
    }

    #[test]
    fn test_derived_key_debug_is_redacted() {
        let cancel = CancellationToken::new();
        let derived = DerivedKey::derive(&key(), &KdfParams::aes(1), &cancel).unwrap();
        assert_eq!(format!("{:?}", derived), "DerivedKey(AES-KDF, [REDACTED])");
    }
}
