use std::collections::BTreeMap;
use std::fs;

use tempfile::TempDir;

use mountdb::remote::Server;
use mountdb::{
    boot, path, BootConfig, CreateOptions, Database, DatabaseManager, DefaultFactory, Error,
    MountConfig, MountPoint, OpenMode, Path, StreamType,
};
use mountdb::memory::MemoryDriver;

/// Every node below `path` with its stream types and contents.
fn dump(manager: &DatabaseManager, path: &Path) -> BTreeMap<String, Vec<(String, Vec<u8>)>> {
    let mut out = BTreeMap::new();
    let info = manager.stat(path).unwrap();
    let streams = info
        .streams
        .iter()
        .map(|s| {
            let data = manager.read_bytes(path, &s.stream_type).unwrap();
            (s.stream_type.to_string(), data.to_vec())
        })
        .collect();
    out.insert(path.to_string(), streams);
    for name in manager.list(path).unwrap() {
        out.extend(dump(manager, &path.child(&name).unwrap()));
    }
    out
}

#[test]
fn end_to_end_scenario() {
    let manager = DatabaseManager::default();
    manager
        .mount(&path!("/"), manager.new_database("root", MemoryDriver::new()))
        .unwrap();

    let node = path!("/a/b/c");
    let info = manager
        .create(&node, &StreamType::config(), CreateOptions::default())
        .unwrap();
    assert_eq!(info.path, node);

    let mut writer = manager.open_for_writing(&node, &StreamType::config()).unwrap();
    writer.write_bytes(b"x=1").unwrap();
    writer.close().unwrap();

    let reader = manager
        .open_stream(&node, &StreamType::config(), OpenMode::Read)
        .unwrap();
    assert_eq!(&reader.contents().unwrap()[..], b"x=1");
    drop(reader);

    manager.delete(&path!("/a"), false).unwrap();
    assert!(matches!(manager.stat(&node), Err(Error::NotFound { .. })));
}

#[test]
fn longest_prefix_reaches_host_directory() {
    let host_dir = TempDir::new().unwrap();
    let manager = boot(
        &BootConfig::default_layout(host_dir.path()),
        DefaultFactory::new(),
    )
    .unwrap();

    let file = path!("/Volumes/Host/file.xml");
    let resolved = manager.resolve_mount(&file).unwrap();
    assert_eq!(resolved.mount, path!("/Volumes/Host"));
    assert_eq!(resolved.relative, path!("/file.xml"));
    assert_eq!(resolved.database.driver_kind(), "host");

    manager
        .create(&file, &StreamType::xml(), CreateOptions::default().leaf())
        .unwrap();
    manager
        .write_bytes(&file, &StreamType::xml(), b"<config/>")
        .unwrap();
    assert_eq!(
        fs::read_to_string(host_dir.path().join("file.xml")).unwrap(),
        "<config/>"
    );

    // Nothing leaked into the root database.
    let root = manager.resolve_mount(&path!("/")).unwrap().database;
    assert!(root.list(&path!("/")).unwrap().is_empty());

    // The host maps extensions to stream types.
    assert!(matches!(
        manager.write_bytes(&file, &StreamType::xml(), b"not xml"),
        Err(Error::UnsupportedFormat { .. })
    ));
}

#[test]
fn refused_host_names_do_not_fault_the_mount() {
    let host_dir = TempDir::new().unwrap();
    fs::write(host_dir.path().join("ok.txt"), b"still here").unwrap();
    let manager = boot(
        &BootConfig::default_layout(host_dir.path()),
        DefaultFactory::new(),
    )
    .unwrap();

    let long = path!("/Volumes/Host").child(&"x".repeat(300)).unwrap();
    assert!(matches!(manager.stat(&long), Err(Error::InvalidPath(_))));

    assert_eq!(
        &manager
            .read_bytes(&path!("/Volumes/Host/ok.txt"), &StreamType::text())
            .unwrap()[..],
        b"still here"
    );
    assert!(manager.mounts().unwrap().iter().all(|m| m.faulted.is_none()));
}

#[test]
fn snapshot_survives_reboot() {
    let state = TempDir::new().unwrap();
    let config = BootConfig {
        root: MountConfig::Memory {
            capacity: None,
            snapshot: Some(state.path().join("root.snap")),
        },
        mounts: Vec::new(),
        manager: Default::default(),
    };

    let manager = boot(&config, DefaultFactory::new()).unwrap();
    manager
        .create(&path!("/etc/app"), &StreamType::config(), CreateOptions::default())
        .unwrap();
    manager
        .write_bytes(&path!("/etc/app"), &StreamType::config(), b"x=1")
        .unwrap();
    manager
        .create(
            &path!("/docs/readme"),
            &StreamType::text(),
            CreateOptions::default().leaf(),
        )
        .unwrap();
    manager
        .add_stream(&path!("/docs/readme"), &StreamType::binary(), Default::default())
        .unwrap();
    manager
        .write_bytes(&path!("/docs/readme"), &StreamType::binary(), &[0, 1, 2])
        .unwrap();
    let before = dump(&manager, &Path::root());
    manager.close().unwrap();

    let rebooted = boot(&config, DefaultFactory::new()).unwrap();
    assert_eq!(dump(&rebooted, &Path::root()), before);
}

#[test]
fn move_across_mounts_copies_then_deletes() {
    let host_dir = TempDir::new().unwrap();
    let manager = boot(
        &BootConfig::default_layout(host_dir.path()),
        DefaultFactory::new(),
    )
    .unwrap();

    manager
        .create(
            &path!("/scratch/report.json"),
            &StreamType::json(),
            CreateOptions::default().leaf(),
        )
        .unwrap();
    manager
        .write_bytes(&path!("/scratch/report.json"), &StreamType::json(), br#"{"ok":true}"#)
        .unwrap();

    manager
        .rename(&path!("/scratch/report.json"), &path!("/Volumes/Host/report.json"))
        .unwrap();

    assert!(!manager.exists(&path!("/scratch/report.json")).unwrap());
    assert_eq!(
        fs::read(host_dir.path().join("report.json")).unwrap(),
        br#"{"ok":true}"#
    );
}

#[test]
fn booted_remote_mount() {
    let server = Server::new();
    let exported = Database::with_driver(MemoryDriver::new());
    exported
        .create(&path!("/shared/motd"), &StreamType::text(), CreateOptions::default())
        .unwrap();
    exported
        .write_bytes(&path!("/shared/motd"), &StreamType::text(), b"hi")
        .unwrap();
    server.register("peer", exported.clone()).unwrap();

    let config = BootConfig {
        root: MountConfig::memory(),
        mounts: vec![MountPoint::new(
            path!("/Volumes/Peer"),
            MountConfig::remote("peer", path!("/shared")),
        )],
        manager: Default::default(),
    };
    let manager = boot(&config, DefaultFactory::new().with_local_server(server)).unwrap();

    assert_eq!(
        &manager
            .read_bytes(&path!("/Volumes/Peer/motd"), &StreamType::text())
            .unwrap()[..],
        b"hi"
    );
    manager
        .create(&path!("/Volumes/Peer/new"), &StreamType::text(), CreateOptions::default())
        .unwrap();
    assert!(exported.exists(&path!("/shared/new")).unwrap());
    assert_eq!(manager.list(&path!("/Volumes/Peer")).unwrap(), vec!["motd", "new"]);
}
