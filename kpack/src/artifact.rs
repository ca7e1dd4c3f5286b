//! Common utilities for artifact directories: the `artifact_manifest.txt`
//! prefix list and copy helpers that preserve symlinks and mode bits.

use anyhow::{ensure, Context, Result};
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

pub(crate) const ARTIFACT_MANIFEST: &str = "artifact_manifest.txt";

/// Read the prefix list of an artifact directory. One prefix per line,
/// blank lines ignored.
pub(crate) fn read_artifact_manifest(artifact_dir: &Path) -> Result<Vec<String>> {
    let path = artifact_dir.join(ARTIFACT_MANIFEST);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading artifact manifest {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub(crate) fn write_artifact_manifest(artifact_dir: &Path, prefixes: &[String]) -> Result<()> {
    let path = artifact_dir.join(ARTIFACT_MANIFEST);
    let mut content = prefixes.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(&path, content)
        .with_context(|| format!("writing artifact manifest {}", path.display()))
}

/// Copy one file or symlink, creating parent directories. Symlink targets
/// are re-created, never followed; `fs::copy` carries the mode bits.
/// Tolerates a destination that already exists, so concurrent workers can
/// race on the same path.
pub(crate) fn copy_preserving(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    if dest.symlink_metadata().is_ok() {
        return Ok(());
    }

    let metadata = source
        .symlink_metadata()
        .with_context(|| format!("reading {}", source.display()))?;
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(source)
            .with_context(|| format!("reading symlink {}", source.display()))?;
        match std::os::unix::fs::symlink(&target, dest) {
            Ok(()) => Ok(()),
            // Another worker created it between our check and now.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e).with_context(|| format!("creating symlink {}", dest.display())),
        }
    } else {
        fs::copy(source, dest)
            .map(|_| ())
            .with_context(|| format!("copying {} to {}", source.display(), dest.display()))
    }
}

/// Deep-copy a directory tree, excluding any `.kpack` directories. Used to
/// materialize generic artifacts, which must carry no device code.
pub(crate) fn copy_tree_excluding_kpack(source: &Path, dest: &Path) -> Result<()> {
    ensure!(
        !dest.exists(),
        "destination prefix already exists: {} (duplicate copy or previous failed run)",
        dest.display()
    );
    fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;

    let mut iterator = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = iterator.next() {
        let entry = entry.with_context(|| format!("walking {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir yields descendants of the root");
        if entry.file_type().is_dir() {
            if entry.file_name() == ".kpack" {
                iterator.skip_current_dir();
                continue;
            }
            fs::create_dir_all(dest.join(relative))
                .with_context(|| format!("creating {}", dest.join(relative).display()))?;
        } else {
            copy_preserving(entry.path(), &dest.join(relative))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_roundtrip_ignores_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(ARTIFACT_MANIFEST),
            "math-libs/BLAS/rocBLAS/stage\n\nkpack/stage\n",
        )
        .unwrap();
        assert_eq!(
            read_artifact_manifest(dir.path()).unwrap(),
            vec!["math-libs/BLAS/rocBLAS/stage", "kpack/stage"]
        );

        write_artifact_manifest(dir.path(), &["a/b".into(), "c".into()]).unwrap();
        assert_eq!(read_artifact_manifest(dir.path()).unwrap(), vec!["a/b", "c"]);
    }

    #[test]
    fn copy_preserves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("librocblas.so.4"), b"elf bytes").unwrap();
        std::os::unix::fs::symlink("librocblas.so.4", src.join("librocblas.so")).unwrap();

        let dst = dir.path().join("dst");
        copy_preserving(&src.join("librocblas.so"), &dst.join("librocblas.so")).unwrap();
        let link = fs::read_link(dst.join("librocblas.so")).unwrap();
        assert_eq!(link, Path::new("librocblas.so.4"));

        // A second copy of the same path is a no-op, not an error.
        copy_preserving(&src.join("librocblas.so"), &dst.join("librocblas.so")).unwrap();
    }

    #[test]
    fn tree_copy_strips_kpack_directories() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("lib/.kpack")).unwrap();
        fs::create_dir_all(src.join("share")).unwrap();
        fs::write(src.join("lib/librocblas.so"), b"host").unwrap();
        fs::write(src.join("lib/.kpack/blas-gfx110X.kpack"), b"kernels").unwrap();
        fs::write(src.join("share/doc.txt"), b"doc").unwrap();

        let dst = dir.path().join("dst");
        copy_tree_excluding_kpack(&src, &dst).unwrap();
        assert!(dst.join("lib/librocblas.so").exists());
        assert!(dst.join("share/doc.txt").exists());
        assert!(!dst.join("lib/.kpack").exists());

        // Copying over an existing destination is refused.
        assert!(copy_tree_excluding_kpack(&src, &dst).is_err());
    }
}
