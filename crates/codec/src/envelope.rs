//! File envelope shared by every batch file.
//!
//! Layout: `[magic: "FBAT"][schema: u8][version: u8]` followed by zero or more
//! frames `[len: u32 BE][record]`. Records are JSON objects, so readers skip
//! fields they do not know and newer writers can add fields freely.

use crate::CodecError;

pub const MAGIC: &[u8; 4] = b"FBAT";

/// Version written by this crate. Readers accept any non-zero version.
pub const SCHEMA_VERSION: u8 = 1;

/// Maximum size of a single record (16 MiB).
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

const PREAMBLE_LEN: usize = MAGIC.len() + 2;

/// Which record schema a file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Schema {
    Header = 0,
    IngestionPayload = 1,
    ValidationPayload = 2,
    SumPayload = 3,
    Signature = 4,
}

impl Schema {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Header),
            1 => Some(Self::IngestionPayload),
            2 => Some(Self::ValidationPayload),
            3 => Some(Self::SumPayload),
            4 => Some(Self::Signature),
            _ => None,
        }
    }
}

/// Write an envelope around already-serialized records.
pub fn write(schema: Schema, records: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
    let body: usize = records.iter().map(|r| 4 + r.len()).sum();
    let mut buf = Vec::with_capacity(PREAMBLE_LEN + body);
    buf.extend_from_slice(MAGIC);
    buf.push(schema as u8);
    buf.push(SCHEMA_VERSION);

    for record in records {
        if record.len() > MAX_RECORD_LEN {
            return Err(CodecError::RecordTooLarge(record.len()));
        }
        buf.extend_from_slice(&(record.len() as u32).to_be_bytes());
        buf.extend_from_slice(record);
    }
    Ok(buf)
}

/// Split an envelope into its record frames, checking magic and schema.
pub fn read(bytes: &[u8], expected: Schema) -> Result<Vec<&[u8]>, CodecError> {
    if bytes.len() < PREAMBLE_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(CodecError::BadMagic);
    }

    let schema_byte = bytes[MAGIC.len()];
    let schema = Schema::from_u8(schema_byte).ok_or(CodecError::UnknownSchema(schema_byte))?;
    if schema != expected {
        return Err(CodecError::SchemaMismatch {
            expected: expected as u8,
            found: schema_byte,
        });
    }

    let version = bytes[MAGIC.len() + 1];
    if version == 0 {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let mut frames = Vec::new();
    let mut rest = &bytes[PREAMBLE_LEN..];
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len > MAX_RECORD_LEN {
            return Err(CodecError::RecordTooLarge(len));
        }
        rest = &rest[4..];
        if rest.len() < len {
            return Err(CodecError::Truncated);
        }
        frames.push(&rest[..len]);
        rest = &rest[len..];
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let records = vec![b"{}".to_vec(), b"{\"a\":1}".to_vec(), Vec::new()];
        let bytes = write(Schema::IngestionPayload, &records).unwrap();
        let frames = read(&bytes, Schema::IngestionPayload).unwrap();
        assert_eq!(frames, vec![&b"{}"[..], &b"{\"a\":1}"[..], &b""[..]]);
    }

    #[test]
    fn test_empty_envelope() {
        let bytes = write(Schema::SumPayload, &[]).unwrap();
        assert_eq!(bytes.len(), 6);
        assert!(read(&bytes, Schema::SumPayload).unwrap().is_empty());
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(read(b"XXXX\x00\x01", Schema::Header), Err(CodecError::BadMagic));
        assert_eq!(read(b"FB", Schema::Header), Err(CodecError::BadMagic));
    }

    #[test]
    fn test_schema_mismatch() {
        let bytes = write(Schema::ValidationPayload, &[]).unwrap();
        assert_eq!(
            read(&bytes, Schema::IngestionPayload),
            Err(CodecError::SchemaMismatch {
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn test_unknown_schema_and_version() {
        assert_eq!(
            read(b"FBAT\x09\x01", Schema::Header),
            Err(CodecError::UnknownSchema(9))
        );
        assert_eq!(
            read(b"FBAT\x00\x00", Schema::Header),
            Err(CodecError::UnsupportedVersion(0))
        );
    }

    #[test]
    fn test_newer_version_accepted() {
        let mut bytes = write(Schema::Header, &[b"{}".to_vec()]).unwrap();
        bytes[5] = SCHEMA_VERSION + 1;
        assert_eq!(read(&bytes, Schema::Header).unwrap().len(), 1);
    }

    #[test]
    fn test_truncated_frame() {
        let mut bytes = write(Schema::Header, &[b"{\"x\":true}".to_vec()]).unwrap();
        bytes.pop();
        assert_eq!(read(&bytes, Schema::Header), Err(CodecError::Truncated));

        let mut dangling = write(Schema::Header, &[]).unwrap();
        dangling.extend_from_slice(&[0, 0]);
        assert_eq!(read(&dangling, Schema::Header), Err(CodecError::Truncated));
    }
}
