/// What the host filesystem lets us restore.
///
/// Resolved once when an extraction starts and handed to every job,
/// instead of each job asking the OS again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// POSIX read/write/execute bits can be set on files.
    pub posix_permissions: bool,
    /// Symbolic links can be created (without special privileges).
    pub symlinks: bool,
}

impl Capabilities {
    /// The capabilities of the platform we were compiled for.
    ///
    /// Windows can make symlinks, but only with Developer Mode or an
    /// elevated token, so we don't count on it.
    pub fn detect() -> Self {
        Self {
            posix_permissions: cfg!(unix),
            symlinks: cfg!(unix),
        }
    }

    /// Neither permissions nor symlinks: files only.
    pub fn plain_files() -> Self {
        Self {
            posix_permissions: false,
            symlinks: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect()
    }
}
