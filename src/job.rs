//! Extracting a single entry: one file or symlink, one job.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use camino::{Utf8Component, Utf8Path};
use log::*;

use crate::permissions::{apply_permissions, to_permission_set};
use crate::platform::Capabilities;
use crate::read::{ArchiveEntry, ArchiveHandle};
use crate::result::*;

/// Size of the buffer each job copies entry data through
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Settings shared by every job in a batch
#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    pub capabilities: Capabilities,
    pub buffer_size: usize,
    /// Create symlinks even if they point outside the target directory.
    pub allow_escaping_symlinks: bool,
}

/// Joins an entry's path onto the target directory,
/// refusing any path that could land outside of it.
///
/// ZIP makes no promises about entry names, so `../../.bashrc`
/// and `/etc/passwd` are both perfectly legal as far as the archive is concerned.
/// `.` components are dropped.
pub fn resolve_destination(root: &Path, entry_path: &Utf8Path) -> ExtractResult<PathBuf> {
    let mut destination = root.to_path_buf();
    let mut depth = 0;
    for component in entry_path.components() {
        match component {
            Utf8Component::Normal(part) => {
                destination.push(part);
                depth += 1;
            }
            Utf8Component::CurDir => {
                warn!("Current dir (.) found in path {}", entry_path);
            }
            Utf8Component::ParentDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {
                return Err(ExtractError::UnsafePath(entry_path.to_owned()));
            }
        }
    }
    if depth == 0 {
        return Err(ExtractError::UnsafePath(entry_path.to_owned()));
    }
    Ok(destination)
}

/// Checks that a symlink stored at `entry_path` pointing at `target`
/// resolves to somewhere inside the target directory.
///
/// This is done lexically, relative to the link's own directory,
/// since the target might not have been extracted yet.
/// `..` is only allowed at the front of the target: after a normal component
/// it would climb out of whatever that component turns out to be on disk,
/// which a later entry (another symlink, say) gets to decide.
///
/// [`ExtractionJob::execute()`] repeats the check against the filesystem
/// right before it creates the link.
pub fn check_symlink_target(entry_path: &Utf8Path, target: &str) -> ExtractResult<()> {
    let escapes = || ExtractError::UnsafeSymlink {
        path: entry_path.to_owned(),
        target: target.to_owned(),
    };

    // Windows drive paths don't parse as prefixes on Unix.
    let bytes = target.as_bytes();
    if target.starts_with('\\') || (bytes.len() >= 2 && bytes[1] == b':') {
        return Err(escapes());
    }

    // How deep the link's directory is within the archive
    let mut depth = entry_path
        .parent()
        .map_or(0, |p| {
            p.components()
                .filter(|c| matches!(c, Utf8Component::Normal(_)))
                .count()
        });

    let mut descended = false;
    for component in Utf8Path::new(target).components() {
        match component {
            Utf8Component::Normal(_) => {
                depth += 1;
                descended = true;
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir if descended => return Err(escapes()),
            Utf8Component::ParentDir => {
                depth = depth.checked_sub(1).ok_or_else(escapes)?;
            }
            Utf8Component::RootDir | Utf8Component::Prefix(_) => return Err(escapes()),
        }
    }
    Ok(())
}

/// One non-directory entry and the directory it's being extracted into
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    entry: ArchiveEntry<'static>,
    root: PathBuf,
}

impl ExtractionJob {
    pub fn new(entry: ArchiveEntry<'static>, root: PathBuf) -> Self {
        debug_assert!(!entry.is_dir());
        Self { entry, root }
    }

    pub fn entry(&self) -> &ArchiveEntry<'static> {
        &self.entry
    }

    /// Writes the entry to disk, returning where it went.
    ///
    /// Symlinks become symlinks if the platform supports them,
    /// and files with their target as contents otherwise.
    /// Regular files get their stored permissions back where the platform allows.
    /// Whatever file or link is already at the destination is replaced.
    ///
    /// Symlinks extracted earlier are followed while finding the destination,
    /// and the entry is refused if they lead it out of the target directory.
    pub fn execute(&self, archive: &ArchiveHandle, settings: &JobSettings) -> ExtractResult<PathBuf> {
        let root = fs::canonicalize(&self.root)
            .io_context(|| format!("Couldn't find target directory {}", self.root.display()))?;
        let destination = make_parents(&root, &self.entry.path)?;

        if self.entry.is_symlink() && settings.capabilities.symlinks {
            let target = archive.symlink_target(&self.entry)?;
            if !settings.allow_escaping_symlinks {
                check_symlink_target(&self.entry.path, &target)?;
                check_resolved_link(&root, &destination, &self.entry.path, &target)?;
            }
            create_symlink(&destination, &target)?;
            debug!("Linked {} -> {}", destination.display(), target);
            return Ok(destination);
        }

        let mut reader = archive.read(&self.entry)?;
        // Don't write through a link left by an earlier extraction,
        // or get stopped by a read-only file it restored.
        clear_destination(&destination)?;
        let mut file = File::create(&destination)
            .io_context(|| format!("Couldn't create file {}", destination.display()))?;
        let written = copy_buffered(&mut reader, &mut file, settings.buffer_size)
            .io_context(|| format!("Couldn't extract {}", self.entry.path))?;
        file.flush()
            .io_context(|| format!("Couldn't flush {}", destination.display()))?;
        drop(file);
        debug!("Wrote {} bytes to {}", written, destination.display());

        if settings.capabilities.posix_permissions {
            if let Some(bits) = self.entry.permission_bits() {
                let permissions = to_permission_set(bits as u32);
                apply_permissions(&destination, permissions).io_context(|| {
                    format!(
                        "Couldn't set permissions of {} to {}",
                        destination.display(),
                        permissions
                    )
                })?;
                trace!("{} is now {}", destination.display(), permissions);
            }
        }

        Ok(destination)
    }
}

/// Creates the directory for an explicit directory entry.
pub(crate) fn create_directory(root: &Path, entry_path: &Utf8Path) -> ExtractResult<PathBuf> {
    let root = fs::canonicalize(root)
        .io_context(|| format!("Couldn't find target directory {}", root.display()))?;
    let lexical = resolve_destination(&root, entry_path)?;
    let directory = contained(&root, &lexical, entry_path)?;
    fs::create_dir_all(&directory)
        .io_context(|| format!("Couldn't create directory {}", directory.display()))?;
    contained(&root, &directory, entry_path)
}

/// Most symlinks followed while resolving one path (Linux's `MAXSYMLINKS`)
const MAX_LINK_HOPS: usize = 40;

/// Resolves an absolute path the way the OS would:
/// symlinks are followed, and `..` climbs out of wherever they went.
/// Components that don't exist (yet) are taken as they are.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    let mut hops = 0;
    resolve_with(path, &mut hops)
}

fn resolve_with(path: &Path, hops: &mut usize) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                let is_link = fs::symlink_metadata(&resolved)
                    .map_or(false, |m| m.file_type().is_symlink());
                if is_link {
                    *hops += 1;
                    if *hops > MAX_LINK_HOPS {
                        return Err(io::Error::new(
                            io::ErrorKind::Other,
                            "Too many levels of symbolic links",
                        ));
                    }
                    let target = fs::read_link(&resolved)?;
                    resolved.pop();
                    // An absolute target replaces the whole thing.
                    let joined = resolved.join(target);
                    resolved = resolve_with(&joined, hops)?;
                }
            }
        }
    }
    Ok(resolved)
}

/// Where `path` really is, if that's inside `root` (which must be canonical).
fn contained(root: &Path, path: &Path, entry_path: &Utf8Path) -> ExtractResult<PathBuf> {
    let resolved =
        resolve(path).io_context(|| format!("Couldn't resolve {}", path.display()))?;
    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        warn!(
            "{} resolves to {}, outside {}",
            entry_path,
            resolved.display(),
            root.display()
        );
        Err(ExtractError::UnsafePath(entry_path.to_owned()))
    }
}

/// Creates the entry's parent directories inside `root`,
/// returning where the entry itself should go.
fn make_parents(root: &Path, entry_path: &Utf8Path) -> ExtractResult<PathBuf> {
    let lexical = resolve_destination(root, entry_path)?;
    let (parent, name) = match (lexical.parent(), lexical.file_name()) {
        (Some(parent), Some(name)) => (parent, name),
        _ => return Err(ExtractError::UnsafePath(entry_path.to_owned())),
    };

    // Check before creating anything, then again after:
    // sibling jobs race to create the same parents (which create_dir_all()
    // is fine with), and might have linked something into the path meanwhile.
    let parent = contained(root, parent, entry_path)?;
    fs::create_dir_all(&parent)
        .io_context(|| format!("Couldn't create directory {}", parent.display()))?;
    let parent = contained(root, &parent, entry_path)?;
    Ok(parent.join(name))
}

/// Checks the link about to be made at `link` against what's on disk now.
fn check_resolved_link(
    root: &Path,
    link: &Path,
    entry_path: &Utf8Path,
    target: &str,
) -> ExtractResult<()> {
    let escapes = || ExtractError::UnsafeSymlink {
        path: entry_path.to_owned(),
        target: target.to_owned(),
    };
    let parent = link.parent().ok_or_else(escapes)?;
    let resolved = resolve(&parent.join(target))
        .io_context(|| format!("Couldn't resolve symlink target {}", target))?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(escapes())
    }
}

/// Removes whatever file or link is at `path` so it can be replaced.
/// Directories are left alone.
fn clear_destination(path: &Path) -> ExtractResult<()> {
    match fs::symlink_metadata(path) {
        Ok(existing) if !existing.is_dir() => {
            fs::remove_file(path).io_context(|| format!("Couldn't replace {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// Copies everything from `reader` to `writer` through one `buffer_size` buffer.
fn copy_buffered<R: Read + ?Sized, W: Write>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut written = 0u64;
    loop {
        let count = match reader.read(&mut buffer) {
            Ok(0) => return Ok(written),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..count])?;
        written += count as u64;
    }
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &str) -> ExtractResult<()> {
    clear_destination(link)?;
    std::os::unix::fs::symlink(target, link)
        .io_context(|| format!("Couldn't create symlink {}", link.display()))
}

#[cfg(not(unix))]
fn create_symlink(link: &Path, _target: &str) -> ExtractResult<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symbolic links are not supported on this platform",
    ))
    .io_context(|| format!("Couldn't create symlink {}", link.display()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn destinations_stay_inside_the_root() {
        let root = Path::new("/tmp/out");
        assert_eq!(
            resolve_destination(root, Utf8Path::new("dir/file2.txt")).unwrap(),
            root.join("dir").join("file2.txt")
        );
        assert_eq!(
            resolve_destination(root, Utf8Path::new("./a/./b")).unwrap(),
            root.join("a").join("b")
        );

        for evil in ["../evil", "a/../../evil", "/etc/passwd", "a/..", ".", ""] {
            match resolve_destination(root, Utf8Path::new(evil)) {
                Err(ExtractError::UnsafePath(p)) => assert_eq!(p, evil),
                other => panic!("{:?} resolved to {:?}", evil, other),
            }
        }
    }

    #[test]
    fn symlinks_inside_the_root_are_fine() {
        check_symlink_target(Utf8Path::new("link"), "file1.txt").unwrap();
        check_symlink_target(Utf8Path::new("a/b/link"), "../../file1.txt").unwrap();
        check_symlink_target(Utf8Path::new("a/link"), "./c/./d").unwrap();
        check_symlink_target(Utf8Path::new("a/link"), ".").unwrap();
    }

    #[test]
    fn symlinks_outside_the_root_are_refused() {
        for (path, target) in [
            ("link", "../outside"),
            ("a/link", "../../outside"),
            ("link", "/etc/passwd"),
            ("link", "C:\\Windows"),
            ("link", "\\\\server\\share"),
            // Depends on what c is by the time anyone follows the link.
            ("a/link", "c/../d"),
            ("a/b/link", "c/../../.."),
        ] {
            assert!(
                matches!(
                    check_symlink_target(Utf8Path::new(path), target),
                    Err(ExtractError::UnsafeSymlink { .. })
                ),
                "{} -> {} was allowed",
                path,
                target
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn resolving_follows_links() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(root.join("real/deeper")).unwrap();
        symlink("real/deeper", root.join("shortcut")).unwrap();
        symlink("..", root.join("real/up")).unwrap();

        assert_eq!(
            resolve(&root.join("shortcut/not-yet/file")).unwrap(),
            root.join("real/deeper/not-yet/file")
        );
        // `..` climbs out of where the link went, not where it sits.
        assert_eq!(
            resolve(&root.join("shortcut/../x")).unwrap(),
            root.join("real/x")
        );
        assert_eq!(resolve(&root.join("real/up/up")).unwrap(), root.join("up"));
        assert_eq!(
            resolve(&root.join("real/up/real/up/..")).unwrap(),
            root.parent().unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn link_loops_give_up() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        symlink("b", root.join("a")).unwrap();
        symlink("a", root.join("b")).unwrap();
        assert!(resolve(&root.join("a/file")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn parents_are_made_inside_the_root() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap().join("root");
        fs::create_dir(&root).unwrap();
        symlink("..", root.join("up")).unwrap();
        symlink(".", root.join("here")).unwrap();

        assert_eq!(
            make_parents(&root, Utf8Path::new("here/a/b.txt")).unwrap(),
            root.join("a/b.txt")
        );
        assert!(root.join("a").is_dir());

        match make_parents(&root, Utf8Path::new("up/escaped/file.txt")) {
            Err(ExtractError::UnsafePath(p)) => assert_eq!(p, "up/escaped/file.txt"),
            other => panic!("Escaped with {:?}", other),
        }
        // Refused before anything was created.
        assert!(!dir.path().join("escaped").exists());

        check_resolved_link(&root, &root.join("a/link"), Utf8Path::new("a/link"), "..").unwrap();
        assert!(matches!(
            check_resolved_link(&root, &root.join("link"), Utf8Path::new("here/link"), ".."),
            Err(ExtractError::UnsafeSymlink { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn clearing_replaces_files_and_links_but_not_dirs() {
        use std::os::unix::fs::{symlink, PermissionsExt};

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("read-only");
        fs::write(&file, "old").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o444)).unwrap();
        let link = dir.path().join("link");
        symlink(&file, &link).unwrap();
        let subdir = dir.path().join("subdir");
        fs::create_dir(&subdir).unwrap();

        clear_destination(&link).unwrap();
        assert!(fs::symlink_metadata(&link).is_err());
        assert!(file.exists());
        clear_destination(&file).unwrap();
        assert!(!file.exists());
        clear_destination(&subdir).unwrap();
        assert!(subdir.is_dir());
        clear_destination(&dir.path().join("missing")).unwrap();
    }

    #[test]
    fn buffered_copy() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        // Buffer smaller than the data, so we go around a few times.
        let n = copy_buffered(&mut data.as_slice(), &mut out, 64).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(out, data);
    }
}
