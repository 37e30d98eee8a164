//! Byte layouts shared by the client and the daemon
//!
//! This module holds the pure encode/decode halves of the wire format so the
//! stream handling in `codec` and the request handling in `server` agree on
//! every offset.

use crate::error::{Result, TransferError};
use crate::protocol::{
    BLOCK_HEADER_LEN, ENVELOPE_PREFIX_LEN, MAGIC, MAX_BLOCK_CHUNK, MAX_FRAME_SIZE, RELEASE_INDEX,
};
use std::path::{Component, Path, PathBuf};

/// Decoded 16-byte envelope prefix
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvelopePrefix {
    pub payload_len: u32,
    pub crc32: u32,
    pub encrypted: bool,
}

/// Build envelope prefix (16 bytes)
/// Format: MAGIC (4) | LENGTH (4) | CRC32 (4) | ENCRYPTED (1) | RESERVED (3)
pub fn build_envelope_prefix(prefix: &EnvelopePrefix) -> [u8; ENVELOPE_PREFIX_LEN] {
    let mut out = [0u8; ENVELOPE_PREFIX_LEN];
    out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&prefix.payload_len.to_le_bytes());
    out[8..12].copy_from_slice(&prefix.crc32.to_le_bytes());
    out[12] = u8::from(prefix.encrypted);
    out
}

/// Parse envelope prefix, validating magic, flag and size
pub fn parse_envelope_prefix(raw: &[u8; ENVELOPE_PREFIX_LEN]) -> Result<EnvelopePrefix> {
    let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    if magic != MAGIC {
        return Err(TransferError::Frame(format!(
            "invalid magic 0x{magic:08X} in envelope prefix"
        )));
    }
    let payload_len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let crc32 = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
    let encrypted = match raw[12] {
        0 => false,
        1 => true,
        other => {
            return Err(TransferError::Frame(format!("invalid encrypted flag {other}")));
        }
    };
    validate_frame_size(payload_len as usize)?;
    Ok(EnvelopePrefix {
        payload_len,
        crc32,
        encrypted,
    })
}

/// Validate envelope payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(TransferError::Frame(format!(
            "frame payload too large: {size} bytes (max: {MAX_FRAME_SIZE})"
        )));
    }
    Ok(())
}

/// Fixed 32-byte header prefixing every block-addressed chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub opcode: i32,
    /// File handle id
    pub arg1: i32,
    /// Block index, or -1 for a release
    pub arg2: i32,
    /// Block size on requests, deny reason on denials
    pub arg3: i32,
    pub chunk_count: i32,
    pub total_len: i32,
    pub remaining_len: i32,
    pub valid_len: i32,
}

impl BlockHeader {
    pub fn new(opcode: u32, fsid: u16, index: i32, arg3: i32) -> Self {
        Self {
            opcode: opcode as i32,
            arg1: i32::from(fsid),
            arg2: index,
            arg3,
            ..Self::default()
        }
    }

    pub fn release(opcode: u32, fsid: u16) -> Self {
        Self::new(opcode, fsid, RELEASE_INDEX, 0)
    }

    pub fn opcode(&self) -> u32 {
        self.opcode as u32
    }

    /// Handle id in Arg1; out-of-range values cannot name a live handle.
    pub fn fsid(&self) -> Result<u16> {
        u16::try_from(self.arg1).map_err(|_| {
            TransferError::ProtocolViolation(format!("handle id {} out of range", self.arg1))
        })
    }

    pub fn is_release(&self) -> bool {
        self.arg2 == RELEASE_INDEX
    }

    /// Same addressing with the chunk bookkeeping fields filled in.
    pub fn with_chunk(&self, chunk_count: i32, total: i32, remaining: i32, valid: i32) -> Self {
        Self {
            chunk_count,
            total_len: total,
            remaining_len: remaining,
            valid_len: valid,
            ..*self
        }
    }

    /// Reply addressed to the same handle and block.
    pub fn reply(&self, opcode: u32, arg3: i32) -> Self {
        Self {
            opcode: opcode as i32,
            arg1: self.arg1,
            arg2: self.arg2,
            arg3,
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN] {
        let fields = [
            self.opcode,
            self.arg1,
            self.arg2,
            self.arg3,
            self.chunk_count,
            self.total_len,
            self.remaining_len,
            self.valid_len,
        ];
        let mut out = [0u8; BLOCK_HEADER_LEN];
        for (slot, value) in out.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8; BLOCK_HEADER_LEN]) -> Self {
        let field = |i: usize| {
            i32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]])
        };
        Self {
            opcode: field(0),
            arg1: field(1),
            arg2: field(2),
            arg3: field(3),
            chunk_count: field(4),
            total_len: field(5),
            remaining_len: field(6),
            valid_len: field(7),
        }
    }

    /// Check the length fields of a chunk given how much was already received.
    pub fn validate_chunk(&self, received: usize) -> Result<()> {
        if self.valid_len < 0 || self.total_len < 0 || self.remaining_len < 0 {
            return Err(TransferError::Frame(format!(
                "negative length field in block header {self:?}"
            )));
        }
        let valid = self.valid_len as usize;
        let total = self.total_len as usize;
        let remaining = self.remaining_len as usize;
        if valid > MAX_BLOCK_CHUNK {
            return Err(TransferError::Frame(format!(
                "block chunk too large: {valid} bytes (max: {MAX_BLOCK_CHUNK})"
            )));
        }
        validate_frame_size(total)?;
        if received + valid + remaining != total {
            return Err(TransferError::Frame(format!(
                "inconsistent block chunk: received {received} + valid {valid} + remaining {remaining} != total {total}"
            )));
        }
        if valid == 0 && remaining > 0 {
            return Err(TransferError::Frame("empty chunk with data remaining".into()));
        }
        Ok(())
    }
}

/// Normalize a path to be safely under a root directory.
/// This prevents path traversal attacks by:
/// 1. Rejecting parent directory components and root/prefix components
/// 2. Rejecting NUL bytes in path
/// 3. Canonicalizing the final path to resolve symlinks
/// 4. Ensuring the result is under the root
///
/// `root` must already be canonical.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        return Err(TransferError::ProtocolViolation("path contains NUL byte".into()));
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(TransferError::Authorization(
                        "path component contains colon".into(),
                    ));
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                return Err(TransferError::Authorization(format!(
                    "path contains disallowed component: {component:?}"
                )));
            }
        }
    }

    let joined = root.join(&safe);

    // Existing paths resolve fully; new files resolve through their parent
    let final_path = if joined.exists() {
        joined.canonicalize()?
    } else {
        match (joined.parent(), joined.file_name()) {
            (Some(parent), Some(name)) if parent.exists() => parent.canonicalize()?.join(name),
            _ => joined,
        }
    };

    if !final_path.starts_with(root) {
        return Err(TransferError::Authorization(format!(
            "path {} escapes root {}",
            p.display(),
            root.display()
        )));
    }

    Ok(final_path)
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            std::fs::create_dir_all(parent)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opcode;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_under_root_safe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();

        let result = normalize_under_root(&root, Path::new("subdir/file.txt")).unwrap();
        assert!(result.starts_with(&root));
        assert!(result.ends_with("subdir/file.txt"));

        let result = normalize_under_root(&root, Path::new("./subdir/./file.txt")).unwrap();
        assert!(result.ends_with("subdir/file.txt"));

        let result = normalize_under_root(&root, Path::new("")).unwrap();
        assert_eq!(result, root);
    }

    #[test]
    fn test_normalize_under_root_unsafe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();

        assert!(normalize_under_root(&root, Path::new("../etc/passwd")).is_err());
        assert!(normalize_under_root(&root, Path::new("subdir/../../etc/passwd")).is_err());
        assert!(normalize_under_root(&root, Path::new("/etc/passwd")).is_err());
        assert!(matches!(
            normalize_under_root(&root, Path::new("file\0.txt")),
            Err(TransferError::ProtocolViolation(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_normalize_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();
        fs::write(outside.path().join("secret"), b"x").unwrap();

        assert!(matches!(
            normalize_under_root(&root, Path::new("link/secret")),
            Err(TransferError::Authorization(_))
        ));
    }

    #[test]
    fn test_envelope_prefix_layout() {
        let prefix = EnvelopePrefix {
            payload_len: 70_000,
            crc32: 0xDEAD_BEEF,
            encrypted: true,
        };
        let raw = build_envelope_prefix(&prefix);
        assert_eq!(&raw[0..4], &[0x75, 0xDA, 0x34, 0x01]);
        assert_eq!(&raw[4..8], &70_000u32.to_le_bytes());
        assert_eq!(raw[12], 1);
        assert_eq!(&raw[13..16], &[0, 0, 0]);
        assert_eq!(parse_envelope_prefix(&raw).unwrap(), prefix);
    }

    #[test]
    fn test_envelope_prefix_rejects_bad_magic_and_size() {
        let mut raw = build_envelope_prefix(&EnvelopePrefix {
            payload_len: 4,
            crc32: 0,
            encrypted: false,
        });
        raw[0] ^= 0xFF;
        assert!(matches!(parse_envelope_prefix(&raw), Err(TransferError::Frame(_))));

        let mut raw = build_envelope_prefix(&EnvelopePrefix {
            payload_len: 4,
            crc32: 0,
            encrypted: false,
        });
        raw[4..8].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_le_bytes());
        assert!(parse_envelope_prefix(&raw).is_err());

        raw[4..8].copy_from_slice(&4u32.to_le_bytes());
        raw[12] = 7;
        assert!(parse_envelope_prefix(&raw).is_err());
    }

    #[test]
    fn test_block_header_field_order() {
        let header = BlockHeader::new(opcode::DOWNLOAD_BLOCK_REQUEST, 513, 2441, 4096)
            .with_chunk(1, 1808, 0, 1808);
        let raw = header.to_bytes();
        assert_eq!(&raw[0..4], &(opcode::DOWNLOAD_BLOCK_REQUEST as i32).to_le_bytes());
        assert_eq!(&raw[4..8], &513i32.to_le_bytes());
        assert_eq!(&raw[8..12], &2441i32.to_le_bytes());
        assert_eq!(&raw[12..16], &4096i32.to_le_bytes());
        assert_eq!(&raw[28..32], &1808i32.to_le_bytes());
        assert_eq!(BlockHeader::from_bytes(&raw), header);
    }

    #[test]
    fn test_release_header() {
        let header = BlockHeader::release(opcode::RELEASE_HANDLE, 9);
        assert!(header.is_release());
        assert_eq!(header.fsid().unwrap(), 9);
        assert_eq!(header.arg2, -1);
    }

    #[test]
    fn test_fsid_out_of_range() {
        let mut header = BlockHeader::new(opcode::DOWNLOAD_BLOCK_REQUEST, 0, 0, 0);
        header.arg1 = 70_000;
        assert!(header.fsid().is_err());
        header.arg1 = -3;
        assert!(header.fsid().is_err());
    }

    #[test]
    fn test_validate_chunk() {
        let base = BlockHeader::new(opcode::UPLOAD_BLOCK_REQUEST, 1, 0, 4096);
        assert!(base.with_chunk(2, 100, 40, 60).validate_chunk(0).is_ok());
        assert!(base.with_chunk(2, 100, 0, 40).validate_chunk(60).is_ok());
        assert!(base.with_chunk(2, 100, 0, 40).validate_chunk(0).is_err());
        assert!(base.with_chunk(1, 10, 10, 0).validate_chunk(0).is_err());
        assert!(base.with_chunk(1, -1, 0, 0).validate_chunk(0).is_err());
        assert!(base.with_chunk(0, 0, 0, 0).validate_chunk(0).is_ok());
    }

    #[test]
    fn test_ensure_parent_exists() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("a/b/c.bin");
        ensure_parent_exists(&target).unwrap();
        assert!(temp_dir.path().join("a/b").is_dir());
        ensure_parent_exists(Path::new("relative.bin")).unwrap();
        fs::write(&target, b"ok").unwrap();
    }
}
