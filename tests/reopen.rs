//! Durability, locking, and password lifecycle across close/reopen.

use std::fs;

use jcxfs::{AuthError, FileOpError, InitOptions, Jcxfs, KvError, OpenError, OpenOptions};
use tempfile::TempDir;

const PASSWORD: &str = "correct horse battery staple";

fn init_db(dir: &TempDir) -> Jcxfs {
    let _ = env_logger::builder().is_test(true).try_init();
    Jcxfs::init(dir.path(), PASSWORD, InitOptions::default()).unwrap()
}

fn reopen(dir: &TempDir, password: &str) -> Result<Jcxfs, OpenError> {
    Jcxfs::open(dir.path(), password, OpenOptions::default())
}

#[test]
fn committed_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = init_db(&dir);
        db.mkdir("/docs", 0o755, 1000, 1000).unwrap();
        db.create("/docs/note", 0o644, 1000, 1000).unwrap();
        db.write("/docs/note", b"remember me", 0).unwrap();
        db.close().unwrap();
    }
    let db = reopen(&dir, PASSWORD).unwrap();
    let mut buf = [0u8; 11];
    assert_eq!(db.read("/docs/note", &mut buf, 0).unwrap(), 11);
    assert_eq!(&buf, b"remember me");
    assert_eq!(db.getattr("/docs/note").unwrap().uid, 1000);
    db.close().unwrap();
}

#[test]
fn wrong_password_fails_to_open() {
    let dir = TempDir::new().unwrap();
    init_db(&dir).close().unwrap();
    match reopen(&dir, "not the password") {
        Err(OpenError::Auth(AuthError::WrongPassword)) => {}
        other => panic!("expected WrongPassword, got {other:?}"),
    }
}

#[test]
fn password_change_closure() {
    let dir = TempDir::new().unwrap();
    {
        let db = init_db(&dir);
        db.create("/kept", 0o644, 0, 0).unwrap();
        db.write("/kept", b"still here", 0).unwrap();
        db.close().unwrap();
    }
    Jcxfs::change_password(dir.path(), PASSWORD, "new secret").unwrap();

    match reopen(&dir, PASSWORD) {
        Err(OpenError::Auth(AuthError::WrongPassword)) => {}
        other => panic!("expected WrongPassword, got {other:?}"),
    }
    let db = reopen(&dir, "new secret").unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(db.read("/kept", &mut buf, 0).unwrap(), 10);
    assert_eq!(&buf, b"still here");
    db.close().unwrap();
}

#[test]
fn change_password_requires_the_old_one() {
    let dir = TempDir::new().unwrap();
    init_db(&dir).close().unwrap();
    assert!(matches!(
        Jcxfs::change_password(dir.path(), "guess", "new"),
        Err(AuthError::WrongPassword)
    ));
}

#[test]
fn tampered_sidecar_fails_the_open() {
    let dir = TempDir::new().unwrap();
    init_db(&dir).close().unwrap();

    let sidecar = dir.path().join("jcxfs.env");
    let text = fs::read_to_string(&sidecar).unwrap();
    let truncated: String = text.lines().take(2).map(|l| format!("{l}\n")).collect();
    fs::write(&sidecar, truncated).unwrap();
    assert!(reopen(&dir, PASSWORD).is_err());

    fs::remove_file(&sidecar).unwrap();
    assert!(reopen(&dir, PASSWORD).is_err());
}

#[test]
fn second_mount_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    match reopen(&dir, PASSWORD) {
        Err(OpenError::Kv(KvError::Locked)) => {}
        other => panic!("expected Locked, got {other:?}"),
    }
    db.close().unwrap();
    reopen(&dir, PASSWORD).unwrap().close().unwrap();
}

#[test]
fn read_only_mounts_refuse_mutation() {
    let dir = TempDir::new().unwrap();
    {
        let db = init_db(&dir);
        db.create("/frozen", 0o644, 0, 0).unwrap();
        db.write("/frozen", b"ice", 0).unwrap();
        db.close().unwrap();
    }
    let db = Jcxfs::open(
        dir.path(),
        PASSWORD,
        OpenOptions {
            read_only: true,
            no_sync: false,
        },
    )
    .unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(db.read("/frozen", &mut buf, 0).unwrap(), 3);
    assert!(matches!(
        db.create("/nope", 0o644, 0, 0),
        Err(FileOpError::Io(KvError::ReadOnly))
    ));
    assert!(matches!(
        db.write("/frozen", b"x", 0),
        Err(FileOpError::Io(KvError::ReadOnly))
    ));
    db.close().unwrap();
}

#[test]
fn init_refuses_an_existing_database() {
    let dir = TempDir::new().unwrap();
    init_db(&dir).close().unwrap();
    assert!(matches!(
        Jcxfs::init(dir.path(), PASSWORD, InitOptions::default()),
        Err(OpenError::Config(_))
    ));
}

#[test]
fn init_validates_the_page_size() {
    let dir = TempDir::new().unwrap();
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(Jcxfs::init(dir.path(), PASSWORD, InitOptions { page_size: 32 }).is_err());
}

#[test]
fn listing_order_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = init_db(&dir);
        db.mkdir("/a", 0o755, 0, 0).unwrap();
        db.mkdir("/b", 0o755, 0, 0).unwrap();
        db.create("/a/x", 0o644, 0, 0).unwrap();
        db.create("/b/y", 0o644, 0, 0).unwrap();
        db.create("/b/z", 0o644, 0, 0).unwrap();
        db.rename("/a/x", "/b/w").unwrap();
        db.close().unwrap();
    }
    let db = reopen(&dir, PASSWORD).unwrap();
    let listing: Vec<String> = db.readdir("/b").unwrap().collect();
    assert_eq!(listing, [".", "..", "y", "z", "w"]);
    db.close().unwrap();
}

#[test]
fn many_files_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = init_db(&dir);
        db.mkdir("/bulk", 0o755, 0, 0).unwrap();
        for i in 0..100 {
            let path = format!("/bulk/file{i:03}");
            db.create(&path, 0o644, 0, 0).unwrap();
            db.write(&path, format!("contents {i}").as_bytes(), 0).unwrap();
        }
        db.close().unwrap();
    }
    let db = reopen(&dir, PASSWORD).unwrap();
    assert_eq!(db.readdir("/bulk").unwrap().count(), 102);
    let mut buf = [0u8; 64];
    let n = db.read("/bulk/file042", &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"contents 42");
    db.close().unwrap();
}

#[test]
fn raw_segments_do_not_leak_plaintext() {
    let dir = TempDir::new().unwrap();
    {
        let db = init_db(&dir);
        db.create("/secret-name", 0o644, 0, 0).unwrap();
        db.write("/secret-name", b"SECRET-CONTENTS", 0).unwrap();
        db.close().unwrap();
    }
    for entry in fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "xd") {
            let raw = fs::read(&path).unwrap();
            assert!(
                !contains(&raw, b"secret-name") && !contains(&raw, b"SECRET-CONTENTS"),
                "plaintext leaked into {}",
                path.display()
            );
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn init_validates_the_page_size_bounds_are_exported() {
    assert!(jcxfs::PAGE_SIZE_MIN <= jcxfs::PAGE_SIZE_DEFAULT);
    assert!(jcxfs::PAGE_SIZE_DEFAULT <= jcxfs::PAGE_SIZE_MAX);
}
