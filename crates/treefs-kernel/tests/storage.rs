//! Disk-backed object stores and the host passthrough.

use std::sync::Arc;

use tempfile::TempDir;
use treefs_kernel::{FileSystemConfig, HostProvider, IoService, ServiceConfig};
use treefs_testutil::init_tracing;
use treefs_types::{ErrorKind, FileSystemKind, FsOption, FsPath};

fn service() -> IoService {
    init_tracing();
    IoService::new(ServiceConfig::transient()).unwrap()
}

#[tokio::test]
async fn disk_file_system_survives_remount() {
    let dir = TempDir::new().unwrap();
    let path = FsPath::object("disk", "master", "/kept/data.txt").unwrap();
    {
        let service = service();
        service
            .new_file_system("git://disk", FileSystemConfig::disk(dir.path()))
            .unwrap();
        service.write_string(&path, "persisted", &[]).await.unwrap();
        service.close_file_system("disk").await.unwrap();
    }

    let service = service();
    service
        .new_file_system("git://disk", FileSystemConfig::disk(dir.path()))
        .unwrap();
    assert_eq!(service.read_all_string(&path).await.unwrap(), "persisted");
    // init plus the write; reopening does not add an init commit.
    assert_eq!(service.commit_log("disk", "master").unwrap().len(), 2);
}

#[tokio::test]
async fn host_mount_is_registered_by_default() {
    let service = IoService::new(ServiceConfig::default()).unwrap();
    let hosts = service.file_systems_of_kind(FileSystemKind::Host);
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].id(), "host");
}

#[tokio::test]
async fn copy_from_object_store_to_host_and_back() {
    let dir = TempDir::new().unwrap();
    let service = service();
    service.mount(Arc::new(HostProvider::new(dir.path()))).unwrap();
    service.new_file_system("git://repo", FileSystemConfig::memory()).unwrap();

    let versioned = service.get_uri("git://repo/report.txt").unwrap();
    let on_host = FsPath::host("/report.txt").unwrap();
    service.write_string(&versioned, "quarterly", &[]).await.unwrap();

    service.copy(&versioned, &on_host, &[]).await.unwrap();
    assert_eq!(std::fs::read_to_string(dir.path().join("report.txt")).unwrap(), "quarterly");

    std::fs::write(dir.path().join("report.txt"), "edited on host").unwrap();
    service
        .copy(&on_host, &versioned, &[FsOption::ReplaceExisting])
        .await
        .unwrap();
    assert_eq!(service.read_all_string(&versioned).await.unwrap(), "edited on host");
}

#[tokio::test]
async fn commit_option_is_unsupported_on_host() {
    let dir = TempDir::new().unwrap();
    let service = service();
    service.mount(Arc::new(HostProvider::new(dir.path()))).unwrap();
    let path = FsPath::host("/a.txt").unwrap();

    let err = service
        .write_string(&path, "x", &[treefs_types::CommitOption::author("amy").into()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

    service.write_string(&path, "x", &[]).await.unwrap();
    service.write_string(&path, "y", &[FsOption::Append]).await.unwrap();
    assert_eq!(service.read_all_string(&path).await.unwrap(), "xy");
}

#[tokio::test]
async fn move_to_host_removes_source() {
    let dir = TempDir::new().unwrap();
    let service = service();
    service.mount(Arc::new(HostProvider::new(dir.path()))).unwrap();
    service.new_file_system("git://repo", FileSystemConfig::memory()).unwrap();

    let from = service.get_uri("git://repo/out.bin").unwrap();
    let to = FsPath::host("/out.bin").unwrap();
    service.write(&from, vec![1u8, 2, 3], &[]).await.unwrap();
    service.move_path(&from, &to, &[]).await.unwrap();

    assert!(service.not_exists(&from).await);
    assert_eq!(std::fs::read(dir.path().join("out.bin")).unwrap(), vec![1, 2, 3]);
}
