//! Blocking recursive copy engine.

use std::fs;
use std::io;
use std::path::Path;

use crate::spec::{CopyTreeError, EnumEntryKind, SpecCopyOptions};
use crate::util::{
    SpecEntryStats, are_identical, classify_pair, copy_file_bytes, create_symbolic_link,
    entry_mode, is_src_subdir, normalize_path, preserve_entry_times, resolve_link_target,
    set_entry_mode, warn_timestamp_precision,
};

/// Copy `path_source` (file, directory, symbolic link or device node) to
/// `path_destination`, blocking the calling thread.
///
/// Behavior is controlled by [`SpecCopyOptions`]:
/// - symlink dereferencing,
/// - timestamp preservation,
/// - overwrite / error-on-exist policy for existing destination files,
/// - an optional pair filter.
///
/// Every `(src, dest)` pair (the top-level one and each child pair during
/// directory recursion) is validated before any mutation of that pair:
/// identical inodes, type conflicts with an existing destination, a
/// destination lexically inside a directory source, and destination
/// ancestors that alias the source (symlink-assisted loops) are all
/// rejected. Validation failures leave the filesystem untouched at the
/// current level; failures of calls that already ran abort the current
/// subtree and surface as [`CopyTreeError::Io`] without visiting further
/// siblings.
pub fn copy_tree<P, Q>(
    path_source: P,
    path_destination: Q,
    spec_cp_options: SpecCopyOptions,
) -> Result<(), CopyTreeError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let path_src = path_source.as_ref();
    let path_dst = path_destination.as_ref();

    warn_timestamp_precision(&spec_cp_options);
    tracing::debug!(
        src = %path_src.display(),
        dst = %path_dst.display(),
        "copy_tree start"
    );

    let Some(spec_entry_stats) = check_paths(path_src, path_dst, &spec_cp_options)? else {
        return Ok(());
    };
    check_parent_paths(path_src, &spec_entry_stats.stat_src, path_dst)?;
    prepare_destination_parent(path_dst)?;
    dispatch_entry(spec_entry_stats, path_src, path_dst, &spec_cp_options)
}

/// Callback form of [`copy_tree`]: runs the blocking engine and invokes
/// `on_complete` exactly once with the outcome.
pub fn copy_tree_with_callback<P, Q, F>(
    path_source: P,
    path_destination: Q,
    spec_cp_options: SpecCopyOptions,
    on_complete: F,
) where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnOnce(Result<(), CopyTreeError>),
{
    on_complete(copy_tree(path_source, path_destination, spec_cp_options));
}

fn io_error(path: &Path, source: io::Error) -> CopyTreeError {
    CopyTreeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn stat_entry(path: &Path, if_dereference: bool) -> io::Result<fs::Metadata> {
    if if_dereference {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    }
}

fn get_stats(
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<SpecEntryStats, CopyTreeError> {
    let stat_src = stat_entry(path_src, spec_cp_options.if_dereference)
        .map_err(|e| io_error(path_src, e))?;
    let stat_dst = match stat_entry(path_dst, spec_cp_options.if_dereference) {
        Ok(stat) => Some(stat),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(io_error(path_dst, e)),
    };
    Ok(SpecEntryStats { stat_src, stat_dst })
}

/// Filter, stat and classify one pair. `Ok(None)` means the pair was
/// filtered out and must be skipped silently.
fn check_paths(
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<Option<SpecEntryStats>, CopyTreeError> {
    if let Some(filter) = spec_cp_options.filter.as_deref()
        && !filter(path_src, path_dst)
    {
        return Ok(None);
    }

    let spec_entry_stats = get_stats(path_src, path_dst, spec_cp_options)?;
    classify_pair(&spec_entry_stats, path_src, path_dst)?;
    Ok(Some(spec_entry_stats))
}

/// Walk the destination's ancestors toward the filesystem root looking for
/// one that shares an inode with the source. The walk ends at the source's
/// own parent, at the root, or at the first missing ancestor.
fn check_parent_paths(
    path_src: &Path,
    stat_src: &fs::Metadata,
    path_dst: &Path,
) -> Result<(), CopyTreeError> {
    let path_parent_src = normalize_path(path_src.parent().unwrap_or(path_src));
    let mut path_cursor = normalize_path(path_dst.parent().unwrap_or(path_dst));

    loop {
        if path_cursor == path_parent_src || path_cursor.parent().is_none() {
            return Ok(());
        }
        match fs::metadata(&path_cursor) {
            Ok(stat_cursor) => {
                if are_identical(stat_src, &stat_cursor) {
                    return Err(CopyTreeError::CopyToSubdirectory {
                        source: path_src.to_path_buf(),
                        destination: path_dst.to_path_buf(),
                    });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(&path_cursor, e)),
        }
        path_cursor = match path_cursor.parent() {
            Some(path_next) => path_next.to_path_buf(),
            None => return Ok(()),
        };
    }
}

/// Top-level only: make sure the destination's parent directory chain
/// exists. Child pairs inherit the directory created by their parent's
/// copy step.
fn prepare_destination_parent(path_dst: &Path) -> Result<(), CopyTreeError> {
    let Some(path_parent_dst) = path_dst.parent() else {
        return Ok(());
    };
    if path_parent_dst.as_os_str().is_empty() || path_parent_dst.exists() {
        return Ok(());
    }
    fs::create_dir_all(path_parent_dst).map_err(|e| io_error(path_parent_dst, e))
}

fn dispatch_entry(
    spec_entry_stats: SpecEntryStats,
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    match EnumEntryKind::from_file_type(spec_entry_stats.stat_src.file_type()) {
        EnumEntryKind::Directory => {
            handle_dir_entry(&spec_entry_stats, path_src, path_dst, spec_cp_options)
        }
        EnumEntryKind::RegularFile | EnumEntryKind::BlockDevice | EnumEntryKind::CharacterDevice => {
            handle_file_entry(&spec_entry_stats, path_src, path_dst, spec_cp_options)
        }
        EnumEntryKind::Symlink => handle_symlink_entry(
            spec_entry_stats.stat_dst.is_some(),
            path_src,
            path_dst,
            spec_cp_options,
        ),
        EnumEntryKind::Socket => Err(CopyTreeError::Socket {
            destination: path_dst.to_path_buf(),
        }),
        EnumEntryKind::Fifo => Err(CopyTreeError::FifoPipe {
            destination: path_dst.to_path_buf(),
        }),
        EnumEntryKind::Unknown => Err(CopyTreeError::UnknownKind {
            destination: path_dst.to_path_buf(),
        }),
    }
}

/// Recursion entry for child pairs: validate, then dispatch.
fn copy_entry(
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    let Some(spec_entry_stats) = check_paths(path_src, path_dst, spec_cp_options)? else {
        return Ok(());
    };
    check_parent_paths(path_src, &spec_entry_stats.stat_src, path_dst)?;
    dispatch_entry(spec_entry_stats, path_src, path_dst, spec_cp_options)
}

fn handle_file_entry(
    spec_entry_stats: &SpecEntryStats,
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    if spec_entry_stats.stat_dst.is_some() {
        if spec_cp_options.if_force {
            fs::remove_file(path_dst).map_err(|e| io_error(path_dst, e))?;
        } else if spec_cp_options.if_error_on_exist {
            return Err(CopyTreeError::DestinationExists {
                destination: path_dst.to_path_buf(),
            });
        } else {
            return Ok(());
        }
    }

    // `fs::copy` refuses non-regular sources; device nodes get a plain
    // byte copy of whatever the kernel exposes.
    if spec_entry_stats.stat_src.file_type().is_file() {
        fs::copy(path_src, path_dst).map_err(|e| io_error(path_dst, e))?;
    } else {
        copy_file_bytes(path_src, path_dst).map_err(|e| io_error(path_dst, e))?;
    }

    let n_mode_src = entry_mode(&spec_entry_stats.stat_src);
    if spec_cp_options.if_preserve_timestamps {
        preserve_entry_times(path_src, path_dst, n_mode_src).map_err(|e| io_error(path_dst, e))?;
    }
    // Runs last so the transient write bit from the timestamp step is undone.
    set_entry_mode(path_dst, n_mode_src).map_err(|e| io_error(path_dst, e))
}

fn handle_dir_entry(
    spec_entry_stats: &SpecEntryStats,
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    if spec_entry_stats.stat_dst.is_none() {
        fs::create_dir(path_dst).map_err(|e| io_error(path_dst, e))?;
    }

    let iter_entries = fs::read_dir(path_src).map_err(|e| io_error(path_src, e))?;
    for entry_res in iter_entries {
        let entry = entry_res.map_err(|e| io_error(path_src, e))?;
        let path_src_child = entry.path();
        let path_dst_child = path_dst.join(entry.file_name());
        copy_entry(&path_src_child, &path_dst_child, spec_cp_options)?;
    }

    set_entry_mode(path_dst, entry_mode(&spec_entry_stats.stat_src))
        .map_err(|e| io_error(path_dst, e))
}

fn handle_symlink_entry(
    if_dst_exists: bool,
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    let mut path_link_target = fs::read_link(path_src).map_err(|e| io_error(path_src, e))?;
    if spec_cp_options.if_dereference {
        path_link_target = resolve_link_target(
            path_src.parent().unwrap_or(Path::new("/")),
            &path_link_target,
        );
    }

    if !if_dst_exists {
        return create_symbolic_link(&path_link_target, path_dst)
            .map_err(|e| io_error(path_dst, e));
    }

    let path_dst_target = match fs::read_link(path_dst) {
        Ok(v) => v,
        Err(e)
            if e.kind() == io::ErrorKind::InvalidInput
                || e.raw_os_error() == Some(libc::EINVAL) =>
        {
            // Destination exists but is not a link; the symlink call below
            // surfaces the ambient EEXIST untouched.
            return create_symbolic_link(&path_link_target, path_dst)
                .map_err(|e| io_error(path_dst, e));
        }
        Err(e) => return Err(io_error(path_dst, e)),
    };

    let mut path_dst_resolved = path_dst_target;
    if spec_cp_options.if_dereference {
        path_dst_resolved = resolve_link_target(
            path_dst.parent().unwrap_or(Path::new("/")),
            &path_dst_resolved,
        );
    }

    if is_src_subdir(&path_link_target, &path_dst_resolved) {
        return Err(CopyTreeError::CopyToSubdirectory {
            source: path_src.to_path_buf(),
            destination: path_dst.to_path_buf(),
        });
    }
    // Unlinking a destination link that contains the source target would
    // erase the content about to be written through the source.
    let stat_src_fresh = fs::metadata(path_src).map_err(|e| io_error(path_src, e))?;
    if stat_src_fresh.is_dir() && is_src_subdir(&path_dst_resolved, &path_link_target) {
        return Err(CopyTreeError::SymlinkToSubdirectory {
            destination: path_dst.to_path_buf(),
        });
    }

    fs::remove_file(path_dst).map_err(|e| io_error(path_dst, e))?;
    create_symbolic_link(&path_link_target, path_dst).map_err(|e| io_error(path_dst, e))
}
