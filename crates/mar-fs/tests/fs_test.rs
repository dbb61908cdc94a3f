//! Read-side behavior of the capability set without an overlay.

use mar_fs::{FileKind, FsError, MayakashiFs, OpenFlags, OVERLAY_HANDLE_BASE};
use mar_format::proto::CompressedMethod;
use mar_format::testing::{self, FixtureFile};
use mar_index::{ArchiveReadOptions, ArchiveTree};
use mar_store::ChunkStore;

fn mount(dir: &std::path::Path, files: &[FixtureFile<'_>]) -> MayakashiFs {
    std::fs::create_dir_all(dir).unwrap();
    let archive = testing::write_archive(&dir.join("fx"), files).unwrap();
    let mut tree = ArchiveTree::new();
    tree.load_mar(&archive, &ArchiveReadOptions::default())
        .unwrap();
    MayakashiFs::new(tree, ChunkStore::new(), None, Vec::new())
}

#[test]
fn getattr_reports_logical_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"0123456789".repeat(100);
    let fs = mount(
        &dir.path().join("m"),
        &[
            FixtureFile::chunked("/big.bin", &data, 256, CompressedMethod::Zstandard),
            FixtureFile::new("/small.txt", b"hi", CompressedMethod::Passthrough),
        ],
    );

    let root = fs.getattr("/").unwrap();
    assert_eq!(root.kind, FileKind::Directory);

    let big = fs.getattr("/big.bin").unwrap();
    assert_eq!(big.kind, FileKind::File);
    assert_eq!(big.size, 1000);
    assert!(big.modified.is_some());

    assert_eq!(fs.getattr("/small.txt").unwrap().size, 2);
    assert!(matches!(fs.getattr("/missing"), Err(FsError::NotFound)));
}

#[test]
fn lookups_are_case_insensitive() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(
        &dir.path().join("m"),
        &[FixtureFile::new(
            "/Foo/Bar.TXT",
            b"hello",
            CompressedMethod::Lz4,
        )],
    );

    assert_eq!(fs.getattr("/foo/bar.txt").unwrap().size, 5);
    assert_eq!(fs.getattr("/FOO/BAR.TXT").unwrap().size, 5);
    assert_eq!(fs.getattr("/Foo").unwrap().kind, FileKind::Directory);
}

#[test]
fn open_and_read_archive_content() {
    let dir = tempfile::tempdir().unwrap();
    let data = b"the archive payload".repeat(50);
    let fs = mount(
        &dir.path().join("m"),
        &[FixtureFile::chunked(
            "/data/file.bin",
            &data,
            128,
            CompressedMethod::Zstandard,
        )],
    );

    let fh = fs.open("/data/file.bin", OpenFlags::read_only()).unwrap();
    assert!(fh < OVERLAY_HANDLE_BASE);

    let mut buf = vec![0u8; data.len()];
    let n = fs.read("/data/file.bin", &mut buf, 0, fh).unwrap();
    assert_eq!(n, data.len());
    assert_eq!(buf, data);

    // offset read spanning chunk boundaries
    let mut window = [0u8; 300];
    let n = fs.read("/data/file.bin", &mut window, 100, fh).unwrap();
    assert_eq!(n, 300);
    assert_eq!(&window[..], &data[100..400]);

    fs.release("/data/file.bin", fh).unwrap();
}

#[test]
fn readdir_lists_archive_entries() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(
        &dir.path().join("m"),
        &[
            FixtureFile::new("/top.txt", b"x", CompressedMethod::Passthrough),
            FixtureFile::new("/Sub/inner.txt", b"yy", CompressedMethod::Passthrough),
        ],
    );

    let entries = fs.readdir("/").unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"."));
    assert!(names.contains(&".."));
    assert!(names.contains(&"top.txt"));
    assert!(names.contains(&"Sub"));

    let top = entries.iter().find(|e| e.name == "top.txt").unwrap();
    assert_eq!(top.attr.unwrap().size, 1);

    assert!(matches!(fs.readdir("/nope"), Err(FsError::NotFound)));
}

#[test]
fn reserved_name_is_hidden() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(
        &dir.path().join("m"),
        &[
            FixtureFile::new("/app/UnityCrashHandler64.exe", b"mz", CompressedMethod::Passthrough),
            FixtureFile::new("/app/game.exe", b"mz", CompressedMethod::Passthrough),
        ],
    );

    assert!(matches!(
        fs.getattr("/app/UnityCrashHandler64.exe"),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        fs.getattr("/app/unitycrashhandler64.exe"),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        fs.open("/app/UnityCrashHandler64.exe", OpenFlags::read_only()),
        Err(FsError::NotFound)
    ));

    let names: Vec<String> = fs
        .readdir("/app")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains(&"game.exe".to_string()));
    assert!(!names
        .iter()
        .any(|n| n.eq_ignore_ascii_case("unitycrashhandler64.exe")));
}

#[test]
fn statfs_is_synthesized() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(
        &dir.path().join("m"),
        &[FixtureFile::new("/x", b"x", CompressedMethod::Passthrough)],
    );
    let st = fs.statfs();
    assert_eq!(st.bfree, 0x1000_0000);
    assert_eq!(st.bsize, 1);
    assert_eq!(st.frsize, 4096);
}

#[test]
fn writes_fail_readonly_without_an_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(
        &dir.path().join("m"),
        &[FixtureFile::new("/a.txt", b"HELLO", CompressedMethod::Lz4)],
    );

    assert!(matches!(
        fs.create("/new.txt", OpenFlags::read_write()),
        Err(FsError::ReadOnly)
    ));
    assert!(matches!(fs.unlink("/a.txt"), Err(FsError::ReadOnly)));
    assert!(matches!(fs.mkdir("/newdir"), Err(FsError::ReadOnly)));
    assert!(matches!(
        fs.rename("/a.txt", "/b.txt"),
        Err(FsError::ReadOnly)
    ));
    assert!(matches!(
        fs.truncate("/a.txt", 0, None),
        Err(FsError::ReadOnly)
    ));

    // write-intent open degrades to a read-only archive handle
    let fh = fs.open("/a.txt", OpenFlags::read_write()).unwrap();
    assert!(fh < OVERLAY_HANDLE_BASE);
    assert!(matches!(
        fs.write("/a.txt", b"J", 0, fh),
        Err(FsError::ReadOnly)
    ));
}

#[test]
fn access_always_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(
        &dir.path().join("m"),
        &[FixtureFile::new("/x", b"x", CompressedMethod::Passthrough)],
    );
    fs.access("/x", 7).unwrap();
    fs.access("/definitely/missing", 0).unwrap();
}
