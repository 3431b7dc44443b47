//! Translating stored Unix modes into permission sets, and applying them.

use std::fmt;
use std::io;
use std::path::Path;

/// One of the nine POSIX read/write/execute permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    OwnerRead,
    OwnerWrite,
    OwnerExecute,
    GroupRead,
    GroupWrite,
    GroupExecute,
    OthersRead,
    OthersWrite,
    OthersExecute,
}

impl Permission {
    /// Every permission, from most to least significant bit.
    pub const ALL: [Permission; 9] = [
        Permission::OwnerRead,
        Permission::OwnerWrite,
        Permission::OwnerExecute,
        Permission::GroupRead,
        Permission::GroupWrite,
        Permission::GroupExecute,
        Permission::OthersRead,
        Permission::OthersWrite,
        Permission::OthersExecute,
    ];

    /// The permission's bit in a Unix mode (`S_IRUSR`, `S_IWUSR`, ...)
    pub fn bit(self) -> u16 {
        match self {
            Permission::OwnerRead => 0o400,
            Permission::OwnerWrite => 0o200,
            Permission::OwnerExecute => 0o100,
            Permission::GroupRead => 0o040,
            Permission::GroupWrite => 0o020,
            Permission::GroupExecute => 0o010,
            Permission::OthersRead => 0o004,
            Permission::OthersWrite => 0o002,
            Permission::OthersExecute => 0o001,
        }
    }
}

/// A set of [`Permission`]s
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PermissionSet(u16);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0 |= permission.bit();
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        Permission::ALL.into_iter().filter(move |p| self.contains(*p))
    }

    /// The set as Unix mode bits, e.g., `0o755`
    pub fn mode(&self) -> u16 {
        self.0
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        let mut set = Self::new();
        for permission in iter {
            set.insert(permission);
        }
        set
    }
}

impl fmt::Debug for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// `ls -l` style: `rwxr-xr-x`
impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (permission, letter) in Permission::ALL.iter().zip("rwxrwxrwx".chars()) {
            let c = if self.contains(*permission) { letter } else { '-' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Translates a stored mode into the permissions it grants.
///
/// Only the low 12 bits are considered, so file type bits are ignored.
/// Of those, setuid, setgid and the sticky bit aren't permissions and are dropped too.
pub fn to_permission_set(mode: u32) -> PermissionSet {
    let mode = (mode & 0o7777) as u16;
    Permission::ALL
        .into_iter()
        .filter(|p| mode & p.bit() != 0)
        .collect()
}

/// Sets the permissions of the file at `path` to exactly `permissions`.
#[cfg(unix)]
pub fn apply_permissions(path: &Path, permissions: PermissionSet) -> io::Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(permissions.mode() as u32))
}

/// Sets the permissions of the file at `path` to exactly `permissions`.
///
/// There are no POSIX permission bits here, so this always fails.
#[cfg(not(unix))]
pub fn apply_permissions(path: &Path, _permissions: PermissionSet) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!(
            "Can't set POSIX permissions on {} on this platform",
            path.display()
        ),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use Permission::*;

    #[test]
    fn rwxr_xr_x() {
        let expected: PermissionSet = [
            OwnerRead,
            OwnerWrite,
            OwnerExecute,
            GroupRead,
            GroupExecute,
            OthersRead,
            OthersExecute,
        ]
        .into_iter()
        .collect();
        let set = to_permission_set(0o755);
        assert_eq!(set, expected);
        assert_eq!(set.len(), 7);
        assert!(!set.contains(GroupWrite));
        assert!(!set.contains(OthersWrite));
        assert_eq!(set.to_string(), "rwxr-xr-x");
    }

    #[test]
    fn file_type_and_special_bits_are_ignored() {
        // Regular file, setuid
        assert_eq!(to_permission_set(0o104644), to_permission_set(0o644));
        assert_eq!(to_permission_set(0o104644).mode(), 0o644);
        // Bits above the 16-bit mode too
        assert_eq!(to_permission_set(0xFFFF_0000), PermissionSet::new());
        assert!(to_permission_set(0o7000).is_empty());
    }

    #[test]
    fn each_bit_maps_to_one_permission() {
        for (i, permission) in Permission::ALL.iter().enumerate() {
            let bit = 0o400 >> i;
            let set = to_permission_set(bit);
            assert_eq!(set.iter().collect::<Vec<_>>(), vec![*permission]);
            assert_eq!(set.mode(), bit as u16);
        }
    }

    #[test]
    fn read_only() {
        let set = to_permission_set(0o444);
        assert!(set.contains(OwnerRead));
        assert!(!set.contains(OwnerWrite));
        assert_eq!(format!("{:?}", set), "{OwnerRead, GroupRead, OthersRead}");
    }

    #[cfg(unix)]
    #[test]
    fn applying() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();

        apply_permissions(&path, to_permission_set(0o750)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o750);

        assert!(apply_permissions(&dir.path().join("missing"), to_permission_set(0o644)).is_err());
    }
}
