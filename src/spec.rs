//! Copy specification models and error types.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSetBuilder};

use crate::util::errno_name;

////////////////////////////////////////////////////////////////////////////////
// #region EnumsInit

/// Filesystem entry taxonomy used by the type dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumEntryKind {
    /// Regular file.
    RegularFile,
    /// Directory.
    Directory,
    /// Symbolic link (only observed when links are not dereferenced).
    Symlink,
    /// Block device; byte-copied as a regular file.
    BlockDevice,
    /// Character device; byte-copied as a regular file.
    CharacterDevice,
    /// Unix domain socket; refused.
    Socket,
    /// Named pipe; refused.
    Fifo,
    /// Anything the platform cannot classify; refused.
    Unknown,
}

impl EnumEntryKind {
    /// Classify a raw [`fs::FileType`].
    pub fn from_file_type(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            return Self::Directory;
        }
        if file_type.is_file() {
            return Self::RegularFile;
        }
        if file_type.is_symlink() {
            return Self::Symlink;
        }
        Self::_from_special_file_type(file_type)
    }

    #[cfg(unix)]
    fn _from_special_file_type(file_type: fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;

        if file_type.is_block_device() {
            return Self::BlockDevice;
        }
        if file_type.is_char_device() {
            return Self::CharacterDevice;
        }
        if file_type.is_socket() {
            return Self::Socket;
        }
        if file_type.is_fifo() {
            return Self::Fifo;
        }
        Self::Unknown
    }

    #[cfg(not(unix))]
    fn _from_special_file_type(_file_type: fs::FileType) -> Self {
        Self::Unknown
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region OptionsAndFilter

/// Caller-supplied pair predicate; `false` skips the pair (and its subtree)
/// silently.
pub type TypeCopyFilter = Arc<dyn Fn(&Path, &Path) -> bool + Send + Sync>;

/// Input options for `copy_tree` / `copy_tree_async`.
#[derive(Clone, Default)]
pub struct SpecCopyOptions {
    /// Follow symbolic links in the source; link targets are materialized.
    pub if_dereference: bool,
    /// Re-apply source atime/mtime to each copied file.
    pub if_preserve_timestamps: bool,
    /// Unlink and replace destination files that already exist.
    pub if_force: bool,
    /// When `if_force` is unset, treat an existing destination file as a
    /// hard error instead of skipping it.
    pub if_error_on_exist: bool,
    /// Optional pair filter, consulted before any stat of the pair.
    pub filter: Option<TypeCopyFilter>,
}

impl fmt::Debug for SpecCopyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecCopyOptions")
            .field("if_dereference", &self.if_dereference)
            .field("if_preserve_timestamps", &self.if_preserve_timestamps)
            .field("if_force", &self.if_force)
            .field("if_error_on_exist", &self.if_error_on_exist)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Build a [`TypeCopyFilter`] from shell-glob patterns matched against file
/// basenames. Directories always pass so traversal can reach matching files
/// below them.
pub fn filter_from_globs(patterns: &[String]) -> Result<TypeCopyFilter, CopyTreeError> {
    let mut builder_glob_set = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            CopyTreeError::InvalidFilterPattern(format!("Invalid filter pattern: {e}"))
        })?;
        builder_glob_set.add(glob);
    }
    let glob_set = builder_glob_set
        .build()
        .map_err(|e| CopyTreeError::InvalidFilterPattern(format!("Invalid filter pattern: {e}")))?;

    Ok(Arc::new(move |path_src: &Path, _path_dst: &Path| {
        if path_src.is_dir() {
            return true;
        }
        match path_src.file_name() {
            Some(name_entry) => glob_set.is_match(Path::new(name_entry)),
            None => false,
        }
    }))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Errors

/// Failure modes of a copy run.
///
/// Pre-flight variants are raised before any mutation at the current level;
/// [`CopyTreeError::Io`] wraps a syscall that has already happened. Every
/// value exposes the symbolic `code()`, numeric `errno()`, the failing
/// `path()` and the logical `syscall()` name.
#[derive(Debug)]
pub enum CopyTreeError {
    /// `src` and `dest` are the same inode, an ancestor of `dest` aliases
    /// `src`, or `dest` lies lexically inside `src`.
    CopyToSubdirectory {
        /// Source path of the offending pair.
        source: PathBuf,
        /// Destination path of the offending pair.
        destination: PathBuf,
    },
    /// Source directory would overwrite an existing non-directory.
    DirectoryToNonDirectory {
        /// Source path of the offending pair.
        source: PathBuf,
        /// Destination path of the offending pair.
        destination: PathBuf,
    },
    /// Source non-directory would overwrite an existing directory.
    NonDirectoryToDirectory {
        /// Source path of the offending pair.
        source: PathBuf,
        /// Destination path of the offending pair.
        destination: PathBuf,
    },
    /// Destination file exists and `if_error_on_exist` is set.
    DestinationExists {
        /// Existing destination path.
        destination: PathBuf,
    },
    /// Source is a Unix domain socket.
    Socket {
        /// Destination path of the refused pair.
        destination: PathBuf,
    },
    /// Source is a named pipe.
    FifoPipe {
        /// Destination path of the refused pair.
        destination: PathBuf,
    },
    /// Replacing the destination link would erase the content about to be
    /// written through the source link.
    SymlinkToSubdirectory {
        /// Destination path of the offending pair.
        destination: PathBuf,
    },
    /// Source kind the dispatcher cannot classify.
    UnknownKind {
        /// Destination path of the refused pair.
        destination: PathBuf,
    },
    /// Invalid pattern handed to [`filter_from_globs`].
    InvalidFilterPattern(String),
    /// A filesystem call failed mid-copy.
    Io {
        /// Path the failing call operated on.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

impl CopyTreeError {
    /// Symbolic error code carried verbatim on the error value.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CopyToSubdirectory { .. } => "ERR_FS_COPY_TO_SUBDIRECTORY",
            Self::DirectoryToNonDirectory { .. } => "ERR_FS_COPY_DIR_TO_NON_DIR",
            Self::NonDirectoryToDirectory { .. } => "ERR_FS_COPY_NON_DIR_TO_DIR",
            Self::DestinationExists { .. } => "ERR_FS_COPY_EEXIST",
            Self::Socket { .. } => "ERR_FS_COPY_SOCKET",
            Self::FifoPipe { .. } => "ERR_FS_COPY_FIFO_PIPE",
            Self::SymlinkToSubdirectory { .. } => "ERR_FS_COPY_SYMLINK_TO_SUBDIRECTORY",
            Self::UnknownKind { .. } => "ERR_FS_COPY_UNKNOWN",
            Self::InvalidFilterPattern(_) => "ERR_FS_COPY_INVALID_FILTER",
            Self::Io { source, .. } => errno_name(source.raw_os_error()),
        }
    }

    /// Numeric errno backing the classification.
    pub fn errno(&self) -> i32 {
        match self {
            Self::CopyToSubdirectory { .. }
            | Self::Socket { .. }
            | Self::FifoPipe { .. }
            | Self::SymlinkToSubdirectory { .. }
            | Self::UnknownKind { .. }
            | Self::InvalidFilterPattern(_) => libc::EINVAL,
            Self::DirectoryToNonDirectory { .. } => libc::EISDIR,
            Self::NonDirectoryToDirectory { .. } => libc::ENOTDIR,
            Self::DestinationExists { .. } => libc::EEXIST,
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Logical syscall name; the engine reports every failure as `copy`.
    pub fn syscall(&self) -> &'static str {
        "copy"
    }

    /// Destination path of the failing pair (failing path for raw I/O
    /// errors). Empty for configuration errors that carry no path.
    pub fn path(&self) -> &Path {
        match self {
            Self::CopyToSubdirectory { destination, .. }
            | Self::DirectoryToNonDirectory { destination, .. }
            | Self::NonDirectoryToDirectory { destination, .. }
            | Self::DestinationExists { destination }
            | Self::Socket { destination }
            | Self::FifoPipe { destination }
            | Self::SymlinkToSubdirectory { destination }
            | Self::UnknownKind { destination } => destination,
            Self::Io { path, .. } => path,
            Self::InvalidFilterPattern(_) => Path::new(""),
        }
    }
}

impl fmt::Display for CopyTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CopyToSubdirectory {
                source,
                destination,
            } => write!(
                f,
                "Cannot copy {} to a subdirectory of itself: {}",
                source.display(),
                destination.display()
            ),
            Self::DirectoryToNonDirectory {
                source,
                destination,
            } => write!(
                f,
                "Cannot overwrite non-directory {} with directory {}",
                destination.display(),
                source.display()
            ),
            Self::NonDirectoryToDirectory {
                source,
                destination,
            } => write!(
                f,
                "Cannot overwrite directory {} with non-directory {}",
                destination.display(),
                source.display()
            ),
            Self::DestinationExists { destination } => {
                write!(f, "Destination already exists: {}", destination.display())
            }
            Self::Socket { destination } => {
                write!(f, "Cannot copy a socket file: {}", destination.display())
            }
            Self::FifoPipe { destination } => {
                write!(f, "Cannot copy a FIFO pipe: {}", destination.display())
            }
            Self::SymlinkToSubdirectory { destination } => write!(
                f,
                "Cannot overwrite symlink in subdirectory of self: {}",
                destination.display()
            ),
            Self::UnknownKind { destination } => write!(
                f,
                "Cannot copy an unknown file type: {}",
                destination.display()
            ),
            Self::InvalidFilterPattern(msg) => write!(f, "{msg}"),
            Self::Io { path, source } => {
                write!(f, "Copy failed at {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for CopyTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
