//! Exercises the local (non-SFTP) filesystem helpers the presentation layer
//! uses for its local file-picker panel, against a real temporary directory.

use conn_supervisor::sftp::local_readdir;

#[tokio::test]
async fn local_readdir_lists_files_and_directories() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
    std::fs::create_dir(dir.path().join("subdir")).unwrap();

    let mut entries = local_readdir(dir.path().to_str().unwrap()).await.unwrap();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "notes.txt");
    assert!(!entries[0].is_dir);
    assert_eq!(entries[0].size, Some(5));
    assert_eq!(entries[1].name, "subdir");
    assert!(entries[1].is_dir);
}

#[tokio::test]
async fn local_readdir_on_missing_path_fails_not_found() {
    let err = local_readdir("/no/such/path/here").await.unwrap_err();
    assert_eq!(err.kind(), conn_supervisor::error::ErrorKind::NotFound);
}

#[test]
fn local_homedir_resolves_to_something_on_this_platform() {
    // dirs::home_dir() returns None only on exotic platforms without a
    // resolvable home; CI/dev containers always have one.
    assert!(conn_supervisor::sftp::local_homedir().is_some());
}
