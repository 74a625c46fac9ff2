//! The generic tile envelope.
//!
//! Standalone documents (array schemas, fragment metadata) are persisted as a
//! *generic tile*: a fixed little-endian header followed by opaque payload
//! bytes. The header carries the encryption kind so that
//! [`array_get_encryption`](crate::coordinator::StorageCoordinator::array_get_encryption)
//! can classify a file without parsing its payload.

use bytes::Bytes;

use crate::encryption::{EncryptionKey, EncryptionType};
use crate::error::StorageError;
use crate::uri::Uri;
use crate::vfs::Vfs;

const GENERIC_TILE_MAGIC: u32 = 0x7464_4247; // "GBdt"
const GENERIC_TILE_VERSION: u16 = 1;

/// Size in bytes of the serialized [`GenericTileHeader`].
pub const GENERIC_TILE_HEADER_SIZE: u64 = 4 + 2 + 1 + 8;

/// The fixed header of a generic tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenericTileHeader {
    /// Format version.
    pub version: u16,
    /// Encryption kind of the payload.
    pub encryption_type: EncryptionType,
    /// Payload length in bytes.
    pub payload_size: u64,
}

impl GenericTileHeader {
    fn to_bytes(self) -> [u8; GENERIC_TILE_HEADER_SIZE as usize] {
        let mut out = [0; GENERIC_TILE_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&GENERIC_TILE_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6] = self.encryption_type.wire_code();
        out[7..15].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; GENERIC_TILE_HEADER_SIZE as usize]) -> Result<Self, StorageError> {
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != GENERIC_TILE_MAGIC {
            return Err(StorageError::ParseError("not a generic tile".to_string()));
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if version > GENERIC_TILE_VERSION {
            return Err(StorageError::ParseError(format!(
                "unsupported generic tile version {version}"
            )));
        }
        Ok(Self {
            version,
            encryption_type: EncryptionType::from_wire_code(bytes[6])?,
            payload_size: u64::from_le_bytes(bytes[7..15].try_into().unwrap()),
        })
    }
}

/// Read only the generic tile header at `offset` in the file at `uri`.
pub fn read_generic_tile_header(
    vfs: &Vfs,
    uri: &Uri,
    offset: u64,
) -> Result<GenericTileHeader, StorageError> {
    let mut buf = [0; GENERIC_TILE_HEADER_SIZE as usize];
    vfs.read(uri, offset, &mut buf)?;
    GenericTileHeader::from_bytes(&buf)
}

/// Read the generic tile at `offset` in the file at `uri` and return its
/// payload.
///
/// # Errors
/// Returns [`StorageError::EncryptionMismatch`] if the header's encryption
/// kind differs from the kind of `key`.
pub fn read_generic(
    vfs: &Vfs,
    uri: &Uri,
    offset: u64,
    key: &EncryptionKey,
) -> Result<Bytes, StorageError> {
    let header = read_generic_tile_header(vfs, uri, offset)?;
    if header.encryption_type != key.kind() {
        return Err(StorageError::EncryptionMismatch(uri.to_string()));
    }
    let payload_size = usize::try_from(header.payload_size)
        .map_err(|_| StorageError::ParseError(format!("{uri}: tile payload too large")))?;
    let mut payload = vec![0; payload_size];
    vfs.read(uri, offset + GENERIC_TILE_HEADER_SIZE, &mut payload)?;
    Ok(Bytes::from(payload))
}

/// Append a generic tile holding `payload` to the file at `uri`.
pub fn write_generic(
    vfs: &Vfs,
    uri: &Uri,
    payload: &[u8],
    key: &EncryptionKey,
) -> Result<(), StorageError> {
    let header = GenericTileHeader {
        version: GENERIC_TILE_VERSION,
        encryption_type: key.kind(),
        payload_size: payload.len() as u64,
    };
    vfs.write(uri, &header.to_bytes())?;
    vfs.write(uri, payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn mem_vfs() -> (Vfs, Uri) {
        let vfs = Vfs::new(&Config::default()).unwrap();
        let dir = Uri::new("mem://tiles").unwrap();
        vfs.create_dir(&dir).unwrap();
        (vfs, dir)
    }

    #[test]
    fn generic_tile_round_trip() {
        let (vfs, dir) = mem_vfs();
        let uri = dir.join("doc.tdb");
        let key = EncryptionKey::no_encryption();
        write_generic(&vfs, &uri, b"{\"v\":1}", &key).unwrap();

        let header = read_generic_tile_header(&vfs, &uri, 0).unwrap();
        assert_eq!(header.encryption_type, EncryptionType::NoEncryption);
        assert_eq!(header.payload_size, 7);
        assert_eq!(read_generic(&vfs, &uri, 0, &key).unwrap().as_ref(), b"{\"v\":1}");
    }

    #[test]
    fn generic_tile_key_kind_checked() {
        let (vfs, dir) = mem_vfs();
        let uri = dir.join("doc.tdb");
        write_generic(&vfs, &uri, b"x", &EncryptionKey::no_encryption()).unwrap();

        let aes = EncryptionKey::new(EncryptionType::Aes256Gcm, vec![7; 32]).unwrap();
        assert!(matches!(
            read_generic(&vfs, &uri, 0, &aes),
            Err(StorageError::EncryptionMismatch(_))
        ));
    }

    #[test]
    fn generic_tile_rejects_garbage() {
        let (vfs, dir) = mem_vfs();
        let uri = dir.join("junk");
        vfs.write(&uri, &[0xff; 32]).unwrap();
        assert!(matches!(
            read_generic_tile_header(&vfs, &uri, 0),
            Err(StorageError::ParseError(_))
        ));
    }
}
