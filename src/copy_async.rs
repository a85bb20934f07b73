//! Async recursive copy engine over `tokio::fs`.
//!
//! Same algorithm and error classification as the blocking engine in
//! [`crate::copy`]; only the way each filesystem call is issued differs.
//! Children are still processed strictly in readdir order, one at a time.

use std::io;
use std::path::Path;

use async_recursion::async_recursion;

use crate::spec::{CopyTreeError, EnumEntryKind, SpecCopyOptions};
use crate::util::{
    SpecEntryStats, are_identical, classify_pair, entry_mode, is_src_subdir, normalize_path,
    preserve_entry_times, resolve_link_target, warn_timestamp_precision,
};

/// Async form of [`crate::copy::copy_tree`]: identical observable effects,
/// each filesystem call awaited.
pub async fn copy_tree<P, Q>(
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
        "copy_tree_async start"
    );

    let Some(spec_entry_stats) = check_paths(path_src, path_dst, &spec_cp_options).await? else {
        return Ok(());
    };
    check_parent_paths(path_src, &spec_entry_stats.stat_src, path_dst).await?;
    prepare_destination_parent(path_dst).await?;
    dispatch_entry(spec_entry_stats, path_src, path_dst, &spec_cp_options).await
}

fn io_error(path: &Path, source: io::Error) -> CopyTreeError {
    CopyTreeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn stat_entry(path: &Path, if_dereference: bool) -> io::Result<std::fs::Metadata> {
    if if_dereference {
        tokio::fs::metadata(path).await
    } else {
        tokio::fs::symlink_metadata(path).await
    }
}

async fn get_stats(
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<SpecEntryStats, CopyTreeError> {
    let stat_src = stat_entry(path_src, spec_cp_options.if_dereference)
        .await
        .map_err(|e| io_error(path_src, e))?;
    let stat_dst = match stat_entry(path_dst, spec_cp_options.if_dereference).await {
        Ok(stat) => Some(stat),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(io_error(path_dst, e)),
    };
    Ok(SpecEntryStats { stat_src, stat_dst })
}

/// Filter, stat and classify one pair. `Ok(None)` means the pair was
/// filtered out and must be skipped silently.
async fn check_paths(
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<Option<SpecEntryStats>, CopyTreeError> {
    if let Some(filter) = spec_cp_options.filter.as_deref()
        && !filter(path_src, path_dst)
    {
        return Ok(None);
    }

    let spec_entry_stats = get_stats(path_src, path_dst, spec_cp_options).await?;
    classify_pair(&spec_entry_stats, path_src, path_dst)?;
    Ok(Some(spec_entry_stats))
}

/// Walk the destination's ancestors toward the filesystem root looking for
/// one that shares an inode with the source.
async fn check_parent_paths(
    path_src: &Path,
    stat_src: &std::fs::Metadata,
    path_dst: &Path,
) -> Result<(), CopyTreeError> {
    let path_parent_src = normalize_path(path_src.parent().unwrap_or(path_src));
    let mut path_cursor = normalize_path(path_dst.parent().unwrap_or(path_dst));

    loop {
        if path_cursor == path_parent_src || path_cursor.parent().is_none() {
            return Ok(());
        }
        match tokio::fs::metadata(&path_cursor).await {
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

async fn prepare_destination_parent(path_dst: &Path) -> Result<(), CopyTreeError> {
    let Some(path_parent_dst) = path_dst.parent() else {
        return Ok(());
    };
    if path_parent_dst.as_os_str().is_empty() {
        return Ok(());
    }
    match tokio::fs::metadata(path_parent_dst).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(path_parent_dst)
                .await
                .map_err(|e| io_error(path_parent_dst, e))
        }
        Err(e) => Err(io_error(path_parent_dst, e)),
    }
}

async fn dispatch_entry(
    spec_entry_stats: SpecEntryStats,
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    match EnumEntryKind::from_file_type(spec_entry_stats.stat_src.file_type()) {
        EnumEntryKind::Directory => {
            handle_dir_entry(&spec_entry_stats, path_src, path_dst, spec_cp_options).await
        }
        EnumEntryKind::RegularFile | EnumEntryKind::BlockDevice | EnumEntryKind::CharacterDevice => {
            handle_file_entry(&spec_entry_stats, path_src, path_dst, spec_cp_options).await
        }
        EnumEntryKind::Symlink => {
            handle_symlink_entry(
                spec_entry_stats.stat_dst.is_some(),
                path_src,
                path_dst,
                spec_cp_options,
            )
            .await
        }
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
#[async_recursion]
async fn copy_entry(
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    let Some(spec_entry_stats) = check_paths(path_src, path_dst, spec_cp_options).await? else {
        return Ok(());
    };
    check_parent_paths(path_src, &spec_entry_stats.stat_src, path_dst).await?;
    dispatch_entry(spec_entry_stats, path_src, path_dst, spec_cp_options).await
}

async fn handle_file_entry(
    spec_entry_stats: &SpecEntryStats,
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    if spec_entry_stats.stat_dst.is_some() {
        if spec_cp_options.if_force {
            tokio::fs::remove_file(path_dst)
                .await
                .map_err(|e| io_error(path_dst, e))?;
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
        tokio::fs::copy(path_src, path_dst)
            .await
            .map_err(|e| io_error(path_dst, e))?;
    } else {
        copy_file_bytes(path_src, path_dst)
            .await
            .map_err(|e| io_error(path_dst, e))?;
    }

    let n_mode_src = entry_mode(&spec_entry_stats.stat_src);
    if spec_cp_options.if_preserve_timestamps {
        let path_src_owned = path_src.to_path_buf();
        let path_dst_owned = path_dst.to_path_buf();
        tokio::task::spawn_blocking(move || {
            preserve_entry_times(&path_src_owned, &path_dst_owned, n_mode_src)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|res| res)
        .map_err(|e| io_error(path_dst, e))?;
    }
    // Runs last so the transient write bit from the timestamp step is undone.
    set_entry_mode(path_dst, n_mode_src)
        .await
        .map_err(|e| io_error(path_dst, e))
}

async fn copy_file_bytes(path_src: &Path, path_dst: &Path) -> io::Result<u64> {
    let mut file_src = tokio::fs::File::open(path_src).await?;
    let mut file_dst = tokio::fs::File::create(path_dst).await?;
    tokio::io::copy(&mut file_src, &mut file_dst).await
}

#[cfg(unix)]
async fn set_entry_mode(path: &Path, n_mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(n_mode)).await
}

#[cfg(not(unix))]
async fn set_entry_mode(_path: &Path, _n_mode: u32) -> io::Result<()> {
    Ok(())
}

async fn handle_dir_entry(
    spec_entry_stats: &SpecEntryStats,
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    if spec_entry_stats.stat_dst.is_none() {
        tokio::fs::create_dir(path_dst)
            .await
            .map_err(|e| io_error(path_dst, e))?;
    }

    let mut iter_entries = tokio::fs::read_dir(path_src)
        .await
        .map_err(|e| io_error(path_src, e))?;
    while let Some(entry) = iter_entries
        .next_entry()
        .await
        .map_err(|e| io_error(path_src, e))?
    {
        let path_src_child = entry.path();
        let path_dst_child = path_dst.join(entry.file_name());
        copy_entry(&path_src_child, &path_dst_child, spec_cp_options).await?;
    }

    set_entry_mode(path_dst, entry_mode(&spec_entry_stats.stat_src))
        .await
        .map_err(|e| io_error(path_dst, e))
}

async fn create_link(path_target: &Path, path_dst: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        tokio::fs::symlink(path_target, path_dst).await
    }
    #[cfg(not(unix))]
    {
        let path_target_owned = path_target.to_path_buf();
        let path_dst_owned = path_dst.to_path_buf();
        tokio::task::spawn_blocking(move || {
            crate::util::create_symbolic_link(&path_target_owned, &path_dst_owned)
        })
        .await
        .map_err(io::Error::other)?
    }
}

async fn handle_symlink_entry(
    if_dst_exists: bool,
    path_src: &Path,
    path_dst: &Path,
    spec_cp_options: &SpecCopyOptions,
) -> Result<(), CopyTreeError> {
    let mut path_link_target = tokio::fs::read_link(path_src)
        .await
        .map_err(|e| io_error(path_src, e))?;
    if spec_cp_options.if_dereference {
        path_link_target = resolve_link_target(
            path_src.parent().unwrap_or(Path::new("/")),
            &path_link_target,
        );
    }

    if !if_dst_exists {
        return create_link(&path_link_target, path_dst)
            .await
            .map_err(|e| io_error(path_dst, e));
    }

    let path_dst_target = match tokio::fs::read_link(path_dst).await {
        Ok(v) => v,
        Err(e)
            if e.kind() == io::ErrorKind::InvalidInput
                || e.raw_os_error() == Some(libc::EINVAL) =>
        {
            // Destination exists but is not a link; the symlink call below
            // surfaces the ambient EEXIST untouched.
            return create_link(&path_link_target, path_dst)
                .await
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
    let stat_src_fresh = tokio::fs::metadata(path_src)
        .await
        .map_err(|e| io_error(path_src, e))?;
    if stat_src_fresh.is_dir() && is_src_subdir(&path_dst_resolved, &path_link_target) {
        return Err(CopyTreeError::SymlinkToSubdirectory {
            destination: path_dst.to_path_buf(),
        });
    }

    tokio::fs::remove_file(path_dst)
        .await
        .map_err(|e| io_error(path_dst, e))?;
    create_link(&path_link_target, path_dst)
        .await
        .map_err(|e| io_error(path_dst, e))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::copy_tree;
    use crate::spec::{SpecCopyOptions, TypeCopyFilter};

    struct TestDir {
        path: PathBuf,
    }

    impl TestDir {
        fn new() -> Self {
            let n = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos();
            let path = std::env::temp_dir().join(format!("treecopy_async_test_{n}"));
            std::fs::create_dir_all(&path).expect("create test dir");
            Self { path }
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn write_text(path: &Path, txt: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, txt).expect("write text");
    }

    #[tokio::test]
    async fn copy_tree_async_smoke_basic() {
        let tmp = TestDir::new();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write_text(&src.join("index.js"), "root");
        write_text(&src.join("a/b/README2.md"), "nested");

        copy_tree(&src, &dst, SpecCopyOptions::default())
            .await
            .expect("copy tree");
        assert_eq!(
            std::fs::read_to_string(dst.join("index.js")).expect("read root"),
            "root"
        );
        assert_eq!(
            std::fs::read_to_string(dst.join("a/b/README2.md")).expect("read nested"),
            "nested"
        );
    }

    #[tokio::test]
    async fn copy_tree_async_rejects_copy_onto_itself() {
        let tmp = TestDir::new();
        let src = tmp.path().join("src");
        write_text(&src.join("f.txt"), "x");

        let err = copy_tree(&src, &src, SpecCopyOptions::default())
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "ERR_FS_COPY_TO_SUBDIRECTORY");
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[tokio::test]
    async fn copy_tree_async_force_overwrites_and_is_idempotent() {
        let tmp = TestDir::new();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write_text(&src.join("f.txt"), "new");
        write_text(&dst.join("f.txt"), "old");

        let spec_cp_options = SpecCopyOptions {
            if_force: true,
            ..SpecCopyOptions::default()
        };
        copy_tree(&src, &dst, spec_cp_options.clone())
            .await
            .expect("first run");
        copy_tree(&src, &dst, spec_cp_options)
            .await
            .expect("second run");
        assert_eq!(
            std::fs::read_to_string(dst.join("f.txt")).expect("read"),
            "new"
        );
    }

    #[tokio::test]
    async fn copy_tree_async_error_on_exist_reports_eexist() {
        let tmp = TestDir::new();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write_text(&src.join("f.txt"), "x");

        copy_tree(&src, &dst, SpecCopyOptions::default())
            .await
            .expect("seed destination");

        let spec_cp_options = SpecCopyOptions {
            if_error_on_exist: true,
            ..SpecCopyOptions::default()
        };
        let err = copy_tree(&src, &dst, spec_cp_options)
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "ERR_FS_COPY_EEXIST");
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[tokio::test]
    async fn copy_tree_async_filter_prunes_whole_subtree() {
        let tmp = TestDir::new();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write_text(&src.join("keep.txt"), "k");
        write_text(&src.join("b/dropped.txt"), "d");

        let filter: TypeCopyFilter =
            Arc::new(|path_src: &Path, _| path_src.file_name() != Some("b".as_ref()));
        let spec_cp_options = SpecCopyOptions {
            filter: Some(filter),
            ..SpecCopyOptions::default()
        };
        copy_tree(&src, &dst, spec_cp_options)
            .await
            .expect("copy tree");

        assert!(dst.join("keep.txt").exists());
        assert!(!dst.join("b").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_tree_async_dereference_materializes_link_targets() {
        use std::os::unix::fs::symlink;

        let tmp = TestDir::new();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write_text(&src.join("root.txt"), "root");
        symlink("root.txt", src.join("link_rel")).expect("create symlink");

        let spec_cp_options = SpecCopyOptions {
            if_dereference: true,
            ..SpecCopyOptions::default()
        };
        copy_tree(&src, &dst, spec_cp_options)
            .await
            .expect("copy tree");

        let stat_link_copy = std::fs::symlink_metadata(dst.join("link_rel")).expect("lstat");
        assert!(stat_link_copy.is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_tree_async_copies_symlink_as_link() {
        use std::os::unix::fs::symlink;

        let tmp = TestDir::new();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write_text(&src.join("root.txt"), "root");
        symlink("root.txt", src.join("link_rel")).expect("create symlink");

        copy_tree(&src, &dst, SpecCopyOptions::default())
            .await
            .expect("copy tree");
        assert!(dst.join("link_rel").is_symlink());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_tree_async_preserves_timestamps() {
        use filetime::{FileTime, set_file_times};

        let tmp = TestDir::new();
        let src = tmp.path().join("stamped.txt");
        let dst = tmp.path().join("copy.txt");
        write_text(&src, "stamped");
        set_file_times(
            &src,
            FileTime::from_unix_time(1_700_000_010, 0),
            FileTime::from_unix_time(1_700_000_020, 0),
        )
        .expect("set times");

        let spec_cp_options = SpecCopyOptions {
            if_preserve_timestamps: true,
            ..SpecCopyOptions::default()
        };
        copy_tree(&src, &dst, spec_cp_options)
            .await
            .expect("copy tree");

        let stat_dst = std::fs::metadata(&dst).expect("dst metadata");
        assert_eq!(
            FileTime::from_last_modification_time(&stat_dst),
            FileTime::from_unix_time(1_700_000_020, 0)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copy_tree_async_detects_symlinked_destination_ancestor() {
        use std::os::unix::fs::symlink;

        let tmp = TestDir::new();
        let src = tmp.path().join("k");
        let dst_root = tmp.path().join("d");
        write_text(&src.join("f.txt"), "x");
        std::fs::create_dir_all(&dst_root).expect("mkdir d");
        symlink(&src, dst_root.join("b")).expect("alias src");

        let err = copy_tree(&src, &dst_root.join("b/c"), SpecCopyOptions::default())
            .await
            .expect_err("must fail");
        assert_eq!(err.code(), "ERR_FS_COPY_TO_SUBDIRECTORY");
    }
}
