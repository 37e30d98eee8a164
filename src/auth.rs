//! Authorization and path translation seams consulted by the daemon
//!
//! The daemon never decides on its own who may read or write, or where a
//! client path lives on disk. It asks an [`AuthorizationProvider`] once per
//! session and a [`PathTranslator`] before every registry operation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransferError};
use crate::protocol_core::normalize_under_root;

/// Permission bitmask granted to a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(0x1);
    pub const WRITE: Permissions = Permissions(0x2);
    pub const LIST: Permissions = Permissions(0x4);
    pub const ALL: Permissions = Permissions(0xF);

    pub fn from_bits(bits: u32) -> Self {
        Permissions(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Permissions) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parse names such as `read`, `write`, `list`, `all`.
    pub fn parse(names: &[String]) -> Result<Self> {
        names.iter().try_fold(Permissions::NONE, |acc, name| {
            let p = match name.to_ascii_lowercase().as_str() {
                "read" => Permissions::READ,
                "write" => Permissions::WRITE,
                "list" => Permissions::LIST,
                "all" => Permissions::ALL,
                other => {
                    return Err(TransferError::Config(format!("unknown permission {other:?}")))
                }
            };
            Ok(acc | p)
        })
    }
}

impl BitOr for Permissions {
    type Output = Permissions;
    fn bitor(self, rhs: Self) -> Self {
        Permissions(self.0 | rhs.0)
    }
}

/// Identity of an established session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub peer: Option<SocketAddr>,
    pub permissions: Permissions,
}

pub trait AuthorizationProvider: Send + Sync {
    /// Permissions for a credential; `Permissions::NONE` refuses the session.
    fn check(&self, credential: &[u8]) -> Permissions;
}

/// Grants everything to everyone.
pub struct AllowAll;

impl AuthorizationProvider for AllowAll {
    fn check(&self, _credential: &[u8]) -> Permissions {
        Permissions::ALL
    }
}

/// Fixed credential table from the daemon configuration.
pub struct StaticTokens {
    tokens: HashMap<Vec<u8>, Permissions>,
}

impl StaticTokens {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u8>, Permissions)>,
    {
        Self {
            tokens: entries.into_iter().collect(),
        }
    }
}

impl AuthorizationProvider for StaticTokens {
    fn check(&self, credential: &[u8]) -> Permissions {
        self.tokens.get(credential).copied().unwrap_or(Permissions::NONE)
    }
}

pub trait PathTranslator: Send + Sync {
    /// Map a client-visible path to a server path.
    fn resolve(&self, virtual_path: &str, session: &SessionInfo) -> Result<PathBuf>;
}

/// Serves everything under one directory; `/` is the directory itself.
pub struct RootJail {
    root: PathBuf,
}

impl RootJail {
    pub fn new(root: &Path) -> std::io::Result<Self> {
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PathTranslator for RootJail {
    fn resolve(&self, virtual_path: &str, _session: &SessionInfo) -> Result<PathBuf> {
        let relative = virtual_path.trim_start_matches('/');
        normalize_under_root(&self.root, Path::new(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session() -> SessionInfo {
        SessionInfo {
            peer: None,
            permissions: Permissions::ALL,
        }
    }

    #[test]
    fn permission_bits() {
        let rw = Permissions::READ | Permissions::WRITE;
        assert_eq!(rw.bits(), 0x3);
        assert!(rw.contains(Permissions::READ));
        assert!(!rw.contains(Permissions::LIST));
        assert!(Permissions::ALL.contains(rw));
        assert!(Permissions::from_bits(0xFF).contains(Permissions::ALL));
        assert_eq!(Permissions::from_bits(0xF0), Permissions::NONE);
    }

    #[test]
    fn parse_names() {
        let p = Permissions::parse(&["Read".into(), "list".into()]).unwrap();
        assert_eq!(p, Permissions::READ | Permissions::LIST);
        assert!(Permissions::parse(&["execute".into()]).is_err());
    }

    #[test]
    fn static_tokens_refuse_unknown() {
        let auth = StaticTokens::new([(b"alice".to_vec(), Permissions::READ)]);
        assert_eq!(auth.check(b"alice"), Permissions::READ);
        assert!(auth.check(b"mallory").is_empty());
        assert_eq!(AllowAll.check(b""), Permissions::ALL);
    }

    #[test]
    fn root_jail_maps_virtual_paths() {
        let dir = TempDir::new().unwrap();
        let jail = RootJail::new(dir.path()).unwrap();
        let resolved = jail.resolve("/data/file.bin", &session()).unwrap();
        assert_eq!(resolved, jail.root().join("data/file.bin"));
        assert_eq!(jail.resolve("/", &session()).unwrap(), jail.root());
        assert!(matches!(
            jail.resolve("/../outside", &session()),
            Err(TransferError::Authorization(_))
        ));
    }
}
