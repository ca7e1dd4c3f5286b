use crate::recognize::{KernelDatabase, RecognizerRegistry};
use crate::scan::{ArtifactPath, ArtifactScanner, ArtifactVisitor};
use crate::visitor::PackVisitor;
use anyhow::{bail, Result};
use kpack_archive::{Compression, PackedArchive};
use offload_bundle::Toolchain;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// Records every visit as `kind:relative/path`.
#[derive(Default)]
struct RecordingVisitor {
    events: Mutex<Vec<String>>,
}

impl RecordingVisitor {
    fn events(self) -> Vec<String> {
        self.events.into_inner().unwrap()
    }

    fn record(&self, kind: &str, artifact: &ArtifactPath) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{kind}:{}", artifact.relative.display()));
    }
}

impl ArtifactVisitor for RecordingVisitor {
    fn visit_opaque_file(&self, artifact: &ArtifactPath) -> Result<()> {
        self.record("opaque", artifact);
        Ok(())
    }

    fn visit_kernel_database(
        &self,
        artifact: &ArtifactPath,
        _database: KernelDatabase,
    ) -> Result<()> {
        self.record("db", artifact);
        Ok(())
    }
}

fn build_tree(root: &Path) {
    let touch = |rel: &str| {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"content").unwrap();
    };
    touch("bin/rocblas-bench");
    touch("lib/librocblas.so.4");
    touch("lib/rocblas/library/TensileLibrary_gfx1100.dat");
    touch("lib/rocblas/library/Kernels_gfx1100.hsaco");
    touch("share/doc.txt");
    std::os::unix::fs::symlink("librocblas.so.4", root.join("lib/librocblas.so")).unwrap();
}

#[test]
fn sequential_scan_is_deterministic_and_claims_databases() {
    let dir = tempfile::tempdir().unwrap();
    build_tree(dir.path());

    let registry = RecognizerRegistry::with_default_recognizers();
    let visitor = RecordingVisitor::default();
    ArtifactScanner::new(&registry)
        .scan_tree(dir.path(), &visitor)
        .unwrap();

    // Sorted walk order, the database claimed as a unit, members never
    // classified again.
    assert_eq!(
        visitor.events(),
        vec![
            "opaque:bin/rocblas-bench",
            "opaque:lib/librocblas.so",
            "opaque:lib/librocblas.so.4",
            "db:lib/rocblas/library",
            "opaque:share/doc.txt",
        ]
    );
}

#[test]
fn parallel_scan_visits_each_path_once() {
    let dir = tempfile::tempdir().unwrap();
    build_tree(dir.path());

    let registry = RecognizerRegistry::with_default_recognizers();
    let visitor = RecordingVisitor::default();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    ArtifactScanner::new(&registry)
        .with_pool(&pool)
        .scan_tree(dir.path(), &visitor)
        .unwrap();

    let mut events = visitor.events();
    events.sort();
    assert_eq!(
        events,
        vec![
            "db:lib/rocblas/library",
            "opaque:bin/rocblas-bench",
            "opaque:lib/librocblas.so",
            "opaque:lib/librocblas.so.4",
            "opaque:share/doc.txt",
        ]
    );
}

/// A visitor failure surfaces as the scan error; other paths still finish.
struct FailingVisitor;

impl ArtifactVisitor for FailingVisitor {
    fn visit_opaque_file(&self, artifact: &ArtifactPath) -> Result<()> {
        if artifact.relative.ends_with("doc.txt") {
            bail!("synthetic failure");
        }
        Ok(())
    }
}

#[test]
fn visitor_errors_propagate() {
    let dir = tempfile::tempdir().unwrap();
    build_tree(dir.path());

    let registry = RecognizerRegistry::with_default_recognizers();
    let err = ArtifactScanner::new(&registry)
        .scan_tree(dir.path(), &FailingVisitor)
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("scan failed"), "got: {message}");
    assert!(message.contains("synthetic failure"), "got: {message}");
}

/// The external tools are never invoked for opaque-only trees, so any
/// existing file stands in for them.
fn stub_toolchain() -> Toolchain {
    let stub = std::env::current_exe().unwrap();
    Toolchain::new(Some(stub.clone()), Some(stub)).unwrap()
}

#[test]
fn pack_visitor_copies_tree_and_writes_empty_archive() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    build_tree(input.path());

    let registry = RecognizerRegistry::with_default_recognizers();
    let visitor = PackVisitor::new(
        output.path(),
        "testgroup",
        "gfx110X",
        vec!["gfx1100".into()],
        Compression::None,
        stub_toolchain(),
    )
    .unwrap();

    ArtifactScanner::new(&registry)
        .scan_tree(input.path(), &visitor)
        .unwrap();
    let summary = visitor.finish().unwrap();

    assert_eq!(summary.opaque_files, 4);
    assert_eq!(summary.kernel_databases, 1);
    assert_eq!(summary.bundled_binaries, 0);
    assert_eq!(summary.kernels, 0);

    // Opaque files and database contents are carried over; the symlink
    // stays a symlink.
    assert!(output.path().join("bin/rocblas-bench").is_file());
    assert!(output
        .path()
        .join("lib/rocblas/library/Kernels_gfx1100.hsaco")
        .is_file());
    let link = fs::read_link(output.path().join("lib/librocblas.so")).unwrap();
    assert_eq!(link, Path::new("librocblas.so.4"));

    // The archive exists and reads back empty; with no device code there is
    // no component manifest.
    let archive = PackedArchive::read(&summary.kpack_path).unwrap();
    assert_eq!(archive.kernel_count(), 0);
    assert_eq!(archive.gfx_arch_family, "gfx110X");
    assert!(!output.path().join(".kpack/testgroup.kpm").exists());
}
