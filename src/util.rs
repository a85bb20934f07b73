use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;

use crate::spec::{CopyTreeError, SpecCopyOptions};

////////////////////////////////////////////////////////////////////////////////
// #region PathPredicates

/// Stat pair captured once per `(src, dest)` at pre-flight time. A missing
/// destination is `None`, not an error.
#[derive(Debug)]
pub(crate) struct SpecEntryStats {
    pub(crate) stat_src: fs::Metadata,
    pub(crate) stat_dst: Option<fs::Metadata>,
}

#[cfg(unix)]
pub(crate) fn are_identical(stat_a: &fs::Metadata, stat_b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;

    // Zero inodes show up on filesystems that do not report identity.
    stat_a.ino() != 0 && stat_a.dev() == stat_b.dev() && stat_a.ino() == stat_b.ino()
}

#[cfg(not(unix))]
pub(crate) fn are_identical(_stat_a: &fs::Metadata, _stat_b: &fs::Metadata) -> bool {
    false
}

fn _absolutize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn _normalize_components(path: &Path) -> Vec<std::ffi::OsString> {
    let path_abs = _absolutize_path(path);
    let mut l_parts: Vec<std::ffi::OsString> = Vec::new();
    for part in path_abs.components() {
        match part {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                l_parts.pop();
            }
            Component::Normal(c_part) => l_parts.push(c_part.to_os_string()),
        }
    }
    l_parts
}

/// Pure lexical containment test: true iff `path_src`'s normalized component
/// sequence is a prefix of `path_dst`'s (equal paths included). Never reads
/// the filesystem.
pub(crate) fn is_src_subdir(path_src: &Path, path_dst: &Path) -> bool {
    let l_parts_src = _normalize_components(path_src);
    let l_parts_dst = _normalize_components(path_dst);
    l_parts_src
        .iter()
        .enumerate()
        .all(|(n_idx, part)| l_parts_dst.get(n_idx) == Some(part))
}

/// Absolute lexical normalization: `.` and `..` segments folded away, no
/// filesystem reads.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut path_resolved = PathBuf::from(std::path::MAIN_SEPARATOR.to_string());
    for part in _normalize_components(path) {
        path_resolved.push(part);
    }
    path_resolved
}

/// Lexically re-anchor a link target read from `readlink` against the
/// directory that holds the link.
pub(crate) fn resolve_link_target(path_base_dir: &Path, path_target: &Path) -> PathBuf {
    if path_target.is_absolute() {
        return normalize_path(path_target);
    }
    normalize_path(&path_base_dir.join(path_target))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region PairClassification

/// Structural pair checks over already-captured stats, in priority order:
/// identity, directory-onto-non-directory, non-directory-onto-directory,
/// lexical containment of the destination inside a directory source.
pub(crate) fn classify_pair(
    spec_entry_stats: &SpecEntryStats,
    path_src: &Path,
    path_dst: &Path,
) -> Result<(), CopyTreeError> {
    let stat_src = &spec_entry_stats.stat_src;

    if let Some(stat_dst) = &spec_entry_stats.stat_dst {
        if are_identical(stat_src, stat_dst) {
            return Err(CopyTreeError::CopyToSubdirectory {
                source: path_src.to_path_buf(),
                destination: path_dst.to_path_buf(),
            });
        }
        if stat_src.is_dir() && !stat_dst.is_dir() {
            return Err(CopyTreeError::DirectoryToNonDirectory {
                source: path_src.to_path_buf(),
                destination: path_dst.to_path_buf(),
            });
        }
        if !stat_src.is_dir() && stat_dst.is_dir() {
            return Err(CopyTreeError::NonDirectoryToDirectory {
                source: path_src.to_path_buf(),
                destination: path_dst.to_path_buf(),
            });
        }
    }

    if stat_src.is_dir() && is_src_subdir(path_src, path_dst) {
        return Err(CopyTreeError::CopyToSubdirectory {
            source: path_src.to_path_buf(),
            destination: path_dst.to_path_buf(),
        });
    }

    Ok(())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ModeAndTimes

#[cfg(unix)]
pub(crate) fn entry_mode(stat: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    stat.permissions().mode()
}

#[cfg(not(unix))]
pub(crate) fn entry_mode(_stat: &fs::Metadata) -> u32 {
    0o666
}

#[cfg(unix)]
pub(crate) fn set_entry_mode(path: &Path, n_mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(n_mode))
}

#[cfg(not(unix))]
pub(crate) fn set_entry_mode(_path: &Path, _n_mode: u32) -> io::Result<()> {
    Ok(())
}

/// Re-apply the source's atime/mtime to an already-copied destination file.
///
/// The source is re-statted because the byte copy's reads have perturbed its
/// atime. A source without the owner write bit gets a transient `0o200` on
/// the destination first; the utimes handle requires write access. The final
/// mode restore happens at the call site, after this returns.
pub(crate) fn preserve_entry_times(
    path_src: &Path,
    path_dst: &Path,
    n_mode_src: u32,
) -> io::Result<()> {
    let stat_src_fresh = fs::metadata(path_src)?;
    if n_mode_src & 0o200 == 0 {
        set_entry_mode(path_dst, n_mode_src | 0o200)?;
    }

    let file_dst = fs::OpenOptions::new().append(true).open(path_dst)?;
    filetime::set_file_handle_times(
        &file_dst,
        Some(FileTime::from_last_access_time(&stat_src_fresh)),
        Some(FileTime::from_last_modification_time(&stat_src_fresh)),
    )
}

/// Byte copy for sources `fs::copy` refuses (block and character devices):
/// read whatever the kernel exposes and write it to the destination.
pub(crate) fn copy_file_bytes(path_src: &Path, path_dst: &Path) -> io::Result<u64> {
    let mut file_src = fs::File::open(path_src)?;
    let mut file_dst = fs::File::create(path_dst)?;
    io::copy(&mut file_src, &mut file_dst)
}

/// Emitted once per invocation: narrow-pointer hosts cannot represent the
/// full timestamp range, so preserved times may lose precision.
pub(crate) fn warn_timestamp_precision(spec_cp_options: &SpecCopyOptions) {
    #[cfg(target_pointer_width = "32")]
    {
        if spec_cp_options.if_preserve_timestamps {
            tracing::warn!(
                "TimestampPrecisionWarning: file timestamps may lose precision on this host"
            );
        }
    }
    #[cfg(not(target_pointer_width = "32"))]
    {
        let _ = spec_cp_options;
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region SymlinksAndErrno

pub(crate) fn create_symbolic_link(path_target: &Path, path_dst: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(path_target, path_dst)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::{symlink_dir, symlink_file};

        if path_target.is_dir() {
            symlink_dir(path_target, path_dst)
        } else {
            symlink_file(path_target, path_dst)
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = path_target;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!(
                "Symbolic links are unsupported on this platform: {}",
                path_dst.display()
            ),
        ))
    }
}

pub(crate) fn errno_name(raw_errno: Option<i32>) -> &'static str {
    match raw_errno {
        Some(libc::EEXIST) => "EEXIST",
        Some(libc::EISDIR) => "EISDIR",
        Some(libc::EINVAL) => "EINVAL",
        Some(libc::ENOTDIR) => "ENOTDIR",
        Some(libc::ENOENT) => "ENOENT",
        Some(libc::EACCES) => "EACCES",
        Some(libc::EPERM) => "EPERM",
        Some(libc::ELOOP) => "ELOOP",
        Some(libc::EXDEV) => "EXDEV",
        _ => "UNKNOWN",
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{errno_name, is_src_subdir, resolve_link_target};

    #[test]
    fn is_src_subdir_detects_nesting_and_self() {
        assert!(is_src_subdir(Path::new("/a/b"), Path::new("/a/b/c")));
        assert!(is_src_subdir(Path::new("/a/b"), Path::new("/a/b")));
        assert!(!is_src_subdir(Path::new("/a/b"), Path::new("/a/bc")));
        assert!(!is_src_subdir(Path::new("/a/b/c"), Path::new("/a/b")));
    }

    #[test]
    fn is_src_subdir_normalizes_dot_segments() {
        assert!(is_src_subdir(
            Path::new("/a/b"),
            Path::new("/a/x/../b/./c")
        ));
        assert!(!is_src_subdir(Path::new("/a/b"), Path::new("/a/b/../c")));
    }

    #[test]
    fn resolve_link_target_anchors_relative_targets() {
        assert_eq!(
            resolve_link_target(Path::new("/a/b"), Path::new("../c")),
            Path::new("/a/c")
        );
        assert_eq!(
            resolve_link_target(Path::new("/a/b"), Path::new("/abs/c")),
            Path::new("/abs/c")
        );
    }

    #[test]
    fn errno_name_maps_common_codes() {
        assert_eq!(errno_name(Some(libc::EEXIST)), "EEXIST");
        assert_eq!(errno_name(Some(libc::ENOENT)), "ENOENT");
        assert_eq!(errno_name(None), "UNKNOWN");
    }
}
