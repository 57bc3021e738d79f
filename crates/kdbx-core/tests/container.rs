use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cipher::{BlockEncrypt, KeyInit};
use sha2::{Digest, Sha256};

use kdbx_core::decrypt::derive_master_key;
use kdbx_core::header::{InnerStream, CIPHER_AES256};
use kdbx_core::{
    decrypt, hash_blocks, BlockFault, ByteSource, Cipher, CipherMethod, CompositeKey, Compression,
    ContainerHeader, ContainerWriter, Database, DecryptOptions, DigestingSource, Error, ErrorKind,
    HashAlgorithm, KeyFromFile, Padding, ProtectedValueCodec, SliceSource, Zeroizing,
};

const XML: &[u8] = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
    "<KeePassFile><Root><Group><Name>Root</Name></Group></Root></KeePassFile>"
)
.as_bytes();

fn fixed_header(compression: Compression) -> ContainerHeader {
    ContainerHeader {
        version: 0x0003_0001,
        comment: None,
        cipher_id: CIPHER_AES256,
        compression,
        master_seed: Zeroizing::new(vec![0x01; 32]),
        transform_seed: Zeroizing::new(vec![0x02; 32]),
        transform_rounds: 1,
        encryption_iv: vec![0x03; 16],
        protected_stream_key: Zeroizing::new(vec![0x04; 32]),
        stream_start_bytes: Zeroizing::new(vec![0x05; 32]),
        inner_stream: InnerStream::Salsa20,
    }
}

fn password_key(password: &str) -> CompositeKey {
    CompositeKey::from_credentials(Some(password), None).unwrap()
}

/// A complete KeePass document carrying the writer's header hash and one
/// protected password
fn document(writer: &ContainerWriter, name: &str, password: &str) -> String {
    let header_hash = BASE64.encode(writer.header_hash().unwrap());
    let mut codec = ProtectedValueCodec::new(writer.protected_stream());
    let title = codec.protect(b"Bank");
    let secret = codec.protect(password.as_bytes());
    format!(
        r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<KeePassFile>
	<Meta>
		<Generator>kdbx-core tests</Generator>
		<HeaderHash>{header_hash}</HeaderHash>
		<DatabaseName>{name}</DatabaseName>
	</Meta>
	<Root>
		<Group>
			<Name>Root</Name>
			<Entry>
				<String><Key>Title</Key><Value Protected="True">{title}</Value></String>
				<String><Key>UserName</Key><Value>alice</Value></String>
				<String><Key>Password</Key><Value Protected="True">{secret}</Value></String>
			</Entry>
			<Entry>
				<String><Key>Title</Key><Value>Empty</Value></String>
			</Entry>
		</Group>
	</Root>
</KeePassFile>
"#
    )
}

#[test]
fn test_minimal_container_by_hand() {
    let header = fixed_header(Compression::None);
    let header_bytes = header.to_bytes().unwrap();
    let key = password_key("password");

    // Independent rendition of the key chain: one AES-256-ECB round over
    // each half of the composite key
    let composite = Sha256::digest(Sha256::digest(b"password"));
    let aes = Aes256::new_from_slice(&header.transform_seed).unwrap();
    let mut transformed = composite.clone();
    for half in transformed.chunks_exact_mut(16) {
        aes.encrypt_block(aes::Block::from_mut_slice(half));
    }
    let mut master_input = header.master_seed.to_vec();
    master_input.extend_from_slice(&Sha256::digest(transformed));
    let master_key = Sha256::digest(&master_input);
    assert_eq!(
        derive_master_key(&header, &composite).unwrap().as_slice(),
        master_key.as_slice()
    );

    let mut body = header.stream_start_bytes.to_vec();
    body.extend_from_slice(&hash_blocks(XML, HashAlgorithm::Sha256));
    let cipher = Cipher::new(
        CipherMethod::Aes256Cbc,
        &master_key,
        &header.encryption_iv,
        Padding::Pkcs7,
    );
    let mut file = header_bytes.clone();
    file.extend_from_slice(&cipher.encrypt(&body).unwrap());

    let container = decrypt(SliceSource::new(file), &key, &DecryptOptions::default()).unwrap();
    assert_eq!(&container.content[..], XML);
    assert!(!container.corrupted());

    let mut digesting = DigestingSource::new(SliceSource::new(header_bytes), HashAlgorithm::Sha256);
    digesting.read_to_end().unwrap();
    assert_eq!(container.header_hash, digesting.digest());
}

#[test]
fn test_open_database_unmasks_protected_values() {
    for compression in [Compression::None, Compression::Gzip] {
        let writer = ContainerWriter::new(ContainerHeader::generate(10, compression).unwrap());
        let xml = document(&writer, "Personal", "correct horse");
        let file = writer.write(&password_key("pw"), xml.as_bytes()).unwrap();

        let options = DecryptOptions::default();
        let db = Database::open(SliceSource::new(file), &password_key("pw"), &options).unwrap();
        assert_eq!(db.name(), "Personal");
        assert_eq!(db.xml(), xml.as_bytes());

        let passwords: Vec<_> = db.protected_values("Password").collect();
        assert_eq!(passwords.len(), 1);
        assert_eq!(passwords[0].plain_string().as_str(), "correct horse");
        assert_eq!(db.protected_fields()[0].value.plain_string().as_str(), "Bank");

        let meta = db.metadata();
        assert_eq!(meta.entry_count, 2);
        assert_eq!(meta.group_count, 1);
        assert_eq!(meta.protected_values, 2);
        assert_eq!(meta.cipher, "aes-256-cbc");
        assert_eq!(meta.version, "3.1");
        assert!(meta.header_hash_verified);
        assert!(!meta.corrupted);
    }
}

#[test]
fn test_header_hash_mismatch() {
    let writer = ContainerWriter::new(ContainerHeader::generate(1, Compression::None).unwrap());
    // Document made for a different header
    let other = ContainerWriter::new(ContainerHeader::generate(1, Compression::None).unwrap());
    let xml = document(&other, "Mismatch", "pw");
    let file = writer.write(&password_key("pw"), xml.as_bytes()).unwrap();

    let options = DecryptOptions::default();
    let err = Database::open(SliceSource::new(file.clone()), &password_key("pw"), &options)
        .unwrap_err();
    assert_eq!(err.to_string(), "Format error: header hash mismatch");

    let lenient = DecryptOptions {
        verify_header_hash: false,
        ..DecryptOptions::default()
    };
    let db = Database::open(SliceSource::new(file), &password_key("pw"), &lenient).unwrap();
    assert!(!db.metadata().header_hash_verified);
}

#[test]
fn test_wrong_credentials() {
    let writer = ContainerWriter::new(ContainerHeader::generate(1, Compression::Gzip).unwrap());
    let xml = document(&writer, "Locked", "pw");
    let file = writer.write(&password_key("right"), xml.as_bytes()).unwrap();

    let options = DecryptOptions::default();
    let err = Database::open(SliceSource::new(file), &password_key("wrong"), &options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
}

#[test]
fn test_tampered_payload() {
    let header = fixed_header(Compression::None);
    let writer = ContainerWriter::new(header);
    let payload = vec![b'x'; 300];
    let mut file = writer.write(&password_key("pw"), &payload).unwrap();
    let header_len = writer.header().to_bytes().unwrap().len();

    // Plaintext layout: 32 marker bytes, 40 bytes of block framing, payload.
    // Flipping ciphertext byte 96 garbles plaintext bytes 96..112 and flips
    // byte 112, all inside the payload.
    file[header_len + 96] ^= 0x01;

    let options = DecryptOptions::default();
    let err = decrypt(SliceSource::new(file.clone()), &password_key("pw"), &options).unwrap_err();
    assert!(matches!(err, Error::Integrity(BlockFault::HashMismatch { index: 0 })));

    let best_effort = DecryptOptions {
        stop_on_error: false,
        ..DecryptOptions::default()
    };
    let container = decrypt(SliceSource::new(file), &password_key("pw"), &best_effort).unwrap();
    assert!(container.corrupted());
    assert_eq!(container.faults, vec![BlockFault::HashMismatch { index: 0 }]);
    assert_eq!(container.content.len(), payload.len());
    assert_ne!(&container.content[..], &payload[..]);
}

#[test]
fn test_truncated_container() {
    let writer = ContainerWriter::new(fixed_header(Compression::None));
    let file = writer.write(&password_key("pw"), XML).unwrap();
    let header_len = writer.header().to_bytes().unwrap().len();
    let open = |bytes: &[u8]| {
        decrypt(
            SliceSource::new(bytes.to_vec()),
            &password_key("pw"),
            &DecryptOptions::default(),
        )
        .unwrap_err()
    };

    // Cut inside the header
    assert_eq!(open(&file[..50]).kind(), ErrorKind::ShortRead);

    // Header only, no body at all
    let err = open(&file[..header_len]);
    assert!(matches!(
        err,
        Error::ShortRead {
            expected: 16,
            actual: 0
        }
    ));

    // Cut in the middle of a cipher block
    let err = open(&file[..file.len() - 5]);
    assert!(matches!(err, Error::ShortRead { actual, .. } if actual % 16 == 11));

    // Dropping the final cipher block leaves aligned input whose last
    // plaintext byte belongs to the zeroed terminator, never valid padding
    assert_eq!(
        open(&file[..file.len() - 16]).kind(),
        ErrorKind::InvalidCredentials
    );
}

#[test]
fn test_transform_round_limit() {
    let writer = ContainerWriter::new(ContainerHeader::generate(50, Compression::None).unwrap());
    let file = writer.write(&password_key("pw"), XML).unwrap();
    let options = DecryptOptions {
        max_transform_rounds: 10,
        ..DecryptOptions::default()
    };
    let err = decrypt(SliceSource::new(file), &password_key("pw"), &options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn test_open_path_with_key_file() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("vault.kdbx");

    let key_file = KeyFromFile::try_new(&[0x5a; 32]).unwrap();
    let key = CompositeKey::from_credentials(Some("pw"), Some(&key_file)).unwrap();

    let writer = ContainerWriter::new(ContainerHeader::generate(5, Compression::Gzip).unwrap());
    let xml = document(&writer, "On disk", "disk secret");
    std::fs::write(&db_path, writer.write(&key, xml.as_bytes()).unwrap()).unwrap();

    let db = Database::open_path(&db_path, &key, &DecryptOptions::default()).unwrap();
    assert_eq!(db.name(), "On disk");

    // Password alone is not enough
    let options = DecryptOptions::default();
    let err = Database::open_path(&db_path, &password_key("pw"), &options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCredentials);

    let err = Database::open_path(dir.path().join("missing.kdbx"), &key, &options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}
