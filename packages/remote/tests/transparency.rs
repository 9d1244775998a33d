use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use mountdb_core::{
    path, CreateOptions, DatabaseManager, Error, ErrorKind, ManagerConfig, NodeKind, OpenMode,
    Path, StreamType,
};
use mountdb_memory::MemoryDriver;
use mountdb_remote::{ChannelConnection, RemoteConfig, RemoteDriver, Server, ServerOptions};

/// Every observable result of a fixed scenario run below `base`.
fn scenario(manager: &DatabaseManager, base: &Path) -> Vec<String> {
    let at = |p: &str| base.join(&Path::parse(p).unwrap());
    let mut log = Vec::new();
    let mut record = |label: &str, value: String| log.push(format!("{}: {}", label, value));

    let info = manager
        .create(&at("/etc/app"), &StreamType::config(), CreateOptions::default())
        .unwrap();
    record("create", format!("{:?} {}", info.kind, info.streams.len()));

    manager
        .write_bytes(&at("/etc/app"), &StreamType::config(), b"x=1")
        .unwrap();
    let mut handle = manager
        .open_stream(&at("/etc/app"), &StreamType::config(), OpenMode::Append)
        .unwrap();
    handle.write_bytes(b"\ny=2").unwrap();
    handle.close().unwrap();
    record(
        "read",
        format!(
            "{:?}",
            manager
                .read_bytes(&at("/etc/app"), &StreamType::config())
                .unwrap()
        ),
    );

    let writer = manager
        .open_for_writing(&at("/etc/app"), &StreamType::config())
        .unwrap();
    record(
        "second writer",
        format!(
            "{:?}",
            manager
                .open_for_writing(&at("/etc/app"), &StreamType::config())
                .map_err(|e| e.kind())
                .err()
        ),
    );
    drop(writer);

    record(
        "missing",
        format!(
            "{:?}",
            manager.stat(&at("/nope")).map_err(|e| e.kind()).err()
        ),
    );
    record(
        "duplicate",
        format!(
            "{:?}",
            manager
                .create(&at("/etc/app"), &StreamType::config(), CreateOptions::default())
                .map_err(|e| e.kind())
                .err()
        ),
    );

    manager
        .create(
            &at("/docs/readme"),
            &StreamType::text(),
            CreateOptions::default().leaf().allow_derived(),
        )
        .unwrap();
    manager
        .write_bytes(&at("/docs/readme"), &StreamType::text(), b"hi")
        .unwrap();
    record(
        "derived",
        format!(
            "{:?}",
            manager.read_bytes(&at("/docs/readme"), &StreamType::xml())
        ),
    );
    record(
        "through leaf",
        format!(
            "{:?}",
            manager
                .create_node(&at("/docs/readme/x"), CreateOptions::default())
                .map_err(|e| e.kind())
                .err()
        ),
    );

    manager.rename(&at("/docs"), &at("/archive")).unwrap();
    record("list", format!("{:?}", manager.list(base).unwrap()));

    let unique = manager
        .create_unique(&at("/archive"), "job", None, CreateOptions::default())
        .unwrap();
    record(
        "unique",
        format!("{}", unique.parent() == Some(at("/archive"))),
    );

    manager.delete(&at("/archive"), false).unwrap();
    record("after delete", format!("{:?}", manager.list(base).unwrap()));

    let info = manager.stat(&at("/etc")).unwrap();
    record(
        "stat",
        format!("{} {:?} {}", info.path == at("/etc"), info.kind, info.children),
    );
    log
}

#[test]
fn remote_mount_is_indistinguishable_from_local() {
    let server = Server::new();
    let exported = mountdb_core::Database::with_driver(MemoryDriver::new());
    server.register("shared", exported.clone()).unwrap();

    let manager = DatabaseManager::new(ManagerConfig::default());
    manager
        .mount(&path!("/"), manager.new_database("root", MemoryDriver::new()))
        .unwrap();
    manager
        .mount(
            &path!("/local"),
            manager.new_database("local", MemoryDriver::new()),
        )
        .unwrap();
    manager
        .mount(
            &path!("/remote"),
            manager.new_database(
                "remote",
                RemoteDriver::new(ChannelConnection::open(&server, "shared")),
            ),
        )
        .unwrap();

    let local = scenario(&manager, &path!("/local"));
    let remote = scenario(&manager, &path!("/remote"));
    assert_eq!(local, remote);

    // The remote scenario really ran on the exported database.
    assert_eq!(
        &exported
            .read_bytes(&path!("/etc/app"), &StreamType::config())
            .unwrap()[..],
        b"x=1\ny=2"
    );
}

#[test]
fn remote_root_maps_to_server_subtree() {
    let server = Server::new();
    let exported = mountdb_core::Database::with_driver(MemoryDriver::new());
    exported
        .create_node(&path!("/tenants/a"), CreateOptions::default())
        .unwrap();
    server.register("tenants", exported.clone()).unwrap();

    let manager = DatabaseManager::new(ManagerConfig::default());
    let proxy = RemoteDriver::new(ChannelConnection::open(&server, "tenants"))
        .with_root(path!("/tenants/a"));
    manager
        .mount(&path!("/a"), manager.new_database("a", proxy))
        .unwrap();

    manager
        .create(&path!("/a/notes"), &StreamType::text(), CreateOptions::default())
        .unwrap();
    assert!(exported.exists(&path!("/tenants/a/notes")).unwrap());

    match manager.stat(&path!("/a/missing")) {
        Err(Error::NotFound { path }) => assert_eq!(path, path!("/a/missing")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn read_only_endpoint_denies_writes() {
    let server = Server::new();
    let exported = mountdb_core::Database::with_driver(MemoryDriver::new());
    exported
        .create(&path!("/motd"), &StreamType::text(), CreateOptions::default())
        .unwrap();
    server
        .register_with("ro", exported, ServerOptions { read_only: true })
        .unwrap();

    let manager = DatabaseManager::new(ManagerConfig::default());
    manager
        .mount(
            &path!("/ro"),
            manager.new_database("ro", RemoteDriver::new(ChannelConnection::open(&server, "ro"))),
        )
        .unwrap();

    assert!(manager.exists(&path!("/ro/motd")).unwrap());
    let denied = manager
        .write_bytes(&path!("/ro/motd"), &StreamType::text(), b"hello")
        .unwrap_err();
    assert_eq!(denied.kind(), ErrorKind::PermissionDenied);
    assert_eq!(denied.path(), Some(&path!("/ro/motd")));
}

#[test]
fn timeouts_do_not_fault_the_mount() {
    let server = Server::new();
    server
        .register(
            "slow",
            mountdb_core::Database::with_driver(MemoryDriver::new()),
        )
        .unwrap();

    let manager = DatabaseManager::new(ManagerConfig::default());
    let proxy = RemoteDriver::new(ChannelConnection::with_latency(
        &server,
        "slow",
        Duration::from_millis(100),
    ))
    .with_timeout(Duration::from_millis(10));
    manager
        .mount(&path!("/slow"), manager.new_database("slow", proxy))
        .unwrap();

    let error = manager.list(&path!("/slow")).unwrap_err();
    assert!(error.is_transient());
    let mounts = manager.mounts().unwrap();
    assert!(mounts.iter().all(|m| m.faulted.is_none()));
}

#[tokio::test]
async fn proxy_over_http() {
    let server = Server::new();
    let exported = mountdb_core::Database::with_driver(MemoryDriver::new());
    server.register("web", exported.clone()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("http://{}/web", listener.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(mountdb_remote::serve(server, listener, async move {
        let _ = stopped.await;
    }));

    let listed = tokio::task::spawn_blocking(move || {
        let driver = RemoteDriver::http(&RemoteConfig::new(uri)).unwrap();
        let db = mountdb_core::Database::with_driver(driver);
        db.create(&path!("/a/b"), &StreamType::json(), CreateOptions::default())
            .unwrap();
        db.write_bytes(&path!("/a/b"), &StreamType::json(), br#"{"k":1}"#)
            .unwrap();
        let info = db.stat(&path!("/a/b")).unwrap();
        assert_eq!(info.kind, NodeKind::Directory);
        db.list(&path!("/a")).unwrap()
    })
    .await
    .unwrap();

    assert_eq!(listed, vec!["b"]);
    assert_eq!(
        &exported
            .read_bytes(&path!("/a/b"), &StreamType::json())
            .unwrap()[..],
        br#"{"k":1}"#
    );

    stop.send(()).unwrap();
    serving.await.unwrap().unwrap();
}
