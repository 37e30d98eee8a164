use anyhow::Result;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shuttle::auth::{AllowAll, AuthorizationProvider, Permissions, RootJail, StaticTokens};
use shuttle::coordinator::Coordinator;
use shuttle::disk::BlockFile;
use shuttle::engine::{EngineOptions, HandleSlot, TransferEngine};
use shuttle::logger::NoopSink;
use shuttle::net::{ConnectOptions, Connector, RemoteSession, TcpConnector};
use shuttle::registry::HandleRegistry;
use shuttle::resume::{ResumeStore, SavePolicy};
use shuttle::server::{Server, ServerOptions};
use shuttle::{Direction, TransferError, TransferStatus, TransferTask};

fn write_file(path: &Path, size: usize, seed: u8) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    let mut val = seed;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_mul(31).wrapping_add(7);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn start_server(root: &Path, auth: Box<dyn AuthorizationProvider>) -> (u16, Arc<HandleRegistry>) {
    let server = Server::bind(
        "127.0.0.1:0",
        auth,
        Box::new(RootJail::new(root).unwrap()),
        ServerOptions::default(),
    )
    .unwrap();
    let port = server.local_addr().unwrap().port();
    let registry = server.registry();
    thread::spawn(move || server.serve());
    (port, registry)
}

fn engine_options() -> EngineOptions {
    EngineOptions {
        pool_size: 8,
        retry_schedule: vec![Duration::from_millis(20)],
    }
}

fn coordinator(
    port: u16,
    options: ConnectOptions,
    journal: Option<Arc<ResumeStore>>,
) -> Coordinator<TcpConnector> {
    let connector = Arc::new(TcpConnector::new("127.0.0.1", port, options));
    let engine = TransferEngine::new(connector, engine_options(), Arc::new(NoopSink)).unwrap();
    Coordinator::new(engine, 4096, journal)
}

fn journal(dir: &Path) -> Arc<ResumeStore> {
    Arc::new(ResumeStore::open(&dir.join("resume.json"), SavePolicy::default()).unwrap())
}

fn same_bytes(a: &Path, b: &Path) -> bool {
    std::fs::read(a).unwrap() == std::fs::read(b).unwrap()
}

#[test]
fn push_then_pull_directory_tree() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let src = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let state = tempfile::tempdir()?;

    let files = [
        ("empty.txt", 0usize),
        ("a.txt", 5_000),
        ("dir1/b.bin", 300_000),
        ("dir1/dir2/c.dat", 5_000_000),
    ];
    for (i, (name, size)) in files.iter().enumerate() {
        write_file(&src.path().join(name), *size, i as u8 + 1)?;
    }
    std::fs::create_dir_all(src.path().join("dir1/vacant"))?;

    let (port, registry) = start_server(srv.path(), Box::new(AllowAll));
    let store = journal(state.path());
    let client = coordinator(port, ConnectOptions::default(), Some(Arc::clone(&store)));

    let pushed = client.upload(src.path(), "/dest")?;
    assert_eq!(pushed.succeeded, 4);
    assert!(pushed.is_clean());
    assert_eq!(pushed.bytes, 5_305_000);
    for (name, _) in &files {
        assert!(
            same_bytes(&src.path().join(name), &srv.path().join("dest").join(name)),
            "{name} differs on server"
        );
    }
    assert!(store.tasks().iter().all(|t| t.status == TransferStatus::Succeeded));
    assert!(srv.path().join("dest/dir1/vacant").is_dir());

    let blank = tempfile::tempdir()?;
    let nothing = client.upload(blank.path(), "/blank")?;
    assert_eq!(nothing.succeeded, 0);
    assert!(srv.path().join("blank").is_dir());

    std::fs::create_dir_all(srv.path().join("dest/dir1/hollow"))?;
    let pulled = client.download("/dest", dst.path())?;
    assert_eq!(pulled.succeeded, 4);
    for (name, _) in &files {
        assert!(
            same_bytes(&src.path().join(name), &dst.path().join(name)),
            "{name} differs after pull"
        );
    }
    assert!(dst.path().join("dir1/hollow").is_dir());
    assert!(dst.path().join("dir1/vacant").is_dir());

    client.disconnect();
    // every handle was released after its file
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn single_file_pull_into_directory_without_encryption() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    write_file(&srv.path().join("data/one.bin"), 70_000, 9)?;
    let (port, _) = start_server(srv.path(), Box::new(AllowAll));
    let options = ConnectOptions {
        encrypt: false,
        block_chunk: 1024,
        ..ConnectOptions::default()
    };
    let client = coordinator(port, options, None);
    let summary = client.download("/data/one.bin", dst.path())?;
    assert_eq!(summary.succeeded, 1);
    assert!(same_bytes(
        &srv.path().join("data/one.bin"),
        &dst.path().join("one.bin")
    ));
    Ok(())
}

#[test]
fn resume_skips_blocks_below_checkpoint() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let state = tempfile::tempdir()?;
    write_file(&srv.path().join("big.bin"), 3_000_000, 3)?;
    write_file(&srv.path().join("grown.bin"), 1_000_000, 4)?;
    let (port, _) = start_server(srv.path(), Box::new(AllowAll));

    // local copy of big.bin holds a marker where the checkpoint says "done"
    let big_local = dst.path().join("big.bin");
    std::fs::write(&big_local, vec![0xEEu8; 3_000_000])?;
    let mut big = TransferTask::new(Direction::Download, "/big.bin", &big_local, 3_000_000, 4096);
    big.low_water_mark = 100;
    big.status = TransferStatus::Paused;

    // grown.bin changed size since the checkpoint, so it starts over
    let grown_local = dst.path().join("grown.bin");
    std::fs::write(&grown_local, vec![0xEEu8; 500_000])?;
    let mut grown = TransferTask::new(Direction::Download, "/grown.bin", &grown_local, 500_000, 4096);
    grown.low_water_mark = 50;
    grown.status = TransferStatus::Paused;

    let store = journal(state.path());
    store.upsert(&big);
    store.upsert(&grown);
    store.save()?;

    let client = coordinator(port, ConnectOptions::default(), Some(Arc::clone(&store)));
    let summary = client.resume_pending()?;
    assert_eq!(summary.succeeded, 2);

    let local = std::fs::read(&big_local)?;
    let remote = std::fs::read(srv.path().join("big.bin"))?;
    let mark = 100 * 4096;
    assert!(local[..mark].iter().all(|b| *b == 0xEE));
    assert_eq!(local[mark..], remote[mark..]);

    assert!(same_bytes(&grown_local, &srv.path().join("grown.bin")));
    assert!(store.pending().is_empty());
    Ok(())
}

#[test]
fn paused_queue_is_persisted_and_resumed() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let state = tempfile::tempdir()?;
    for (i, name) in ["tree/x.bin", "tree/y.bin", "tree/sub/z.bin"].iter().enumerate() {
        write_file(&srv.path().join(name), 200_000 + i * 1000, i as u8)?;
    }
    let (port, _) = start_server(srv.path(), Box::new(AllowAll));
    let store = journal(state.path());
    let client = coordinator(port, ConnectOptions::default(), Some(Arc::clone(&store)));

    client.pause();
    let summary = client.download("/tree", dst.path())?;
    assert_eq!(summary.paused, 3);
    assert_eq!(summary.succeeded, 0);

    let reopened = ResumeStore::open(store.path(), SavePolicy::default())?;
    assert_eq!(reopened.pending().len(), 3);

    client.resume();
    let summary = client.resume_pending()?;
    assert_eq!(summary.succeeded, 3);
    for name in ["x.bin", "y.bin", "sub/z.bin"] {
        assert!(same_bytes(&srv.path().join("tree").join(name), &dst.path().join(name)));
    }
    Ok(())
}

#[test]
fn evicted_handle_is_reacquired_mid_transfer() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    write_file(&srv.path().join("big.bin"), 2_000_000, 5)?;
    let (port, registry) = start_server(srv.path(), Box::new(AllowAll));

    let connector = Arc::new(TcpConnector::new("127.0.0.1", port, ConnectOptions::default()));
    let engine = TransferEngine::new(Arc::clone(&connector), engine_options(), Arc::new(NoopSink))?;
    let mut control = connector.connect()?;
    let grant = control.open_handle(Direction::Download, "/big.bin", 0)?;

    // simulate the server dropping every handle (restart, idle eviction)
    registry.clear();

    let local_path = dst.path().join("big.bin");
    let mut task = TransferTask::new(Direction::Download, "/big.bin", &local_path, grant.length, 4096);
    let slot = Arc::new(HandleSlot::new(grant.fsid, Direction::Download, "/big.bin", grant.length));
    let local = BlockFile::open_write(&local_path, grant.length)?;
    engine.transfer_one(&mut task, Arc::clone(&slot), local, None)?;

    assert_eq!(task.status, TransferStatus::Succeeded);
    assert!(same_bytes(&local_path, &srv.path().join("big.bin")));
    assert_eq!(registry.len(), 1);
    control.release_handle(slot.fsid())?;
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn wrong_credential_is_refused() {
    let srv = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let (port, _) = start_server(
        srv.path(),
        Box::new(StaticTokens::new([(b"s3cret".to_vec(), Permissions::ALL)])),
    );
    let options = ConnectOptions {
        credential: b"guess".to_vec(),
        ..ConnectOptions::default()
    };
    let client = coordinator(port, options, None);
    let err = client.download("/", dst.path()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TransferError>(),
        Some(TransferError::Authorization(_))
    ));
}

#[test]
fn read_only_credential_cannot_upload() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let src = tempfile::tempdir()?;
    write_file(&src.path().join("f.bin"), 10_000, 1)?;
    let (port, _) = start_server(
        srv.path(),
        Box::new(StaticTokens::new([(
            b"reader".to_vec(),
            Permissions::READ | Permissions::LIST,
        )])),
    );
    let options = ConnectOptions {
        credential: b"reader".to_vec(),
        ..ConnectOptions::default()
    };
    let client = coordinator(port, options, None);
    let summary = client.upload(&src.path().join("f.bin"), "/f.bin")?;
    assert_eq!(summary.failed, 1);
    assert!(!srv.path().join("f.bin").exists());
    Ok(())
}
