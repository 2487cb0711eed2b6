// Copyright 2020 Joyent, Inc.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_test::block_on;
use tokio_util::codec::Framed;

use cloudfn_rpc::messages::{Answer, AnswerBody, DirectoryEntry, FileInfo};
use cloudfn_rpc::methods::{
    BoxFuture, CallContext, DeclaredType, MethodCandidate, MethodRegistry, PrimitiveType,
    ProcedureError, Role,
};
use cloudfn_rpc::planner::TransferPart;
use cloudfn_rpc::policy::ReadOnly;
use cloudfn_rpc::protocol::{Message, MessageCodec, MessageStatus, DEFAULT_MAX_FRAME_SIZE};
use cloudfn_rpc::storage::{FileStore, LocalFileStore};
use cloudfn_rpc::transfer::{
    ContentTransport, DirectoryOptions, FileUrlTransport, Progress, TransferOptions,
};
use cloudfn_rpc::{
    CancellationToken, Client, ClientConfig, Error, Fault, Server, ServerConfig, Source,
};

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn int() -> DeclaredType {
    DeclaredType::Primitive(PrimitiveType::Int)
}

fn test_methods() -> MethodRegistry {
    MethodRegistry::from_candidates(vec![
        MethodCandidate::new("Math", "Add", |_ctx: CallContext, args: Vec<Value>| async move {
            let a = args[0].as_i64().unwrap_or_default();
            let b = args[1].as_i64().unwrap_or_default();
            Ok::<Value, ProcedureError>(json!(a + b))
        })
        .param("conn", DeclaredType::CallerContext)
        .param("a", int())
        .param("b", int())
        .returns(DeclaredType::Primitive(PrimitiveType::Long)),
        MethodCandidate::new("Geometry", "Size", |_ctx: CallContext, _args: Vec<Value>| async move {
            Ok::<Value, ProcedureError>(json!({"w": 3, "h": 4}))
        })
        .returns(DeclaredType::Structure {
            type_name: String::from("Size"),
            fields: vec![(String::from("w"), int()), (String::from("h"), int())],
        }),
        MethodCandidate::new("Admin", "Reset", |_ctx: CallContext, _args: Vec<Value>| async move {
            Ok::<Value, ProcedureError>(Value::Null)
        })
        .role(Role::Admin)
        .command("reset server state"),
        MethodCandidate::new("Slow", "Wait", |ctx: CallContext, args: Vec<Value>| async move {
            let ms = args[0].as_u64().unwrap_or_default();
            let mut waited = 0;
            while waited < ms {
                if ctx.is_cancelled() {
                    return Err(ProcedureError::new("abandoned"));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                waited += 10;
            }
            Ok::<Value, ProcedureError>(json!(true))
        })
        .param("ms", int())
        .returns(DeclaredType::Primitive(PrimitiveType::Bool)),
    ])
    .expect("test methods register")
}

struct Harness {
    server: Arc<Server>,
    addr: SocketAddr,
    project: tempfile::TempDir,
    storage: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Harness {
        Harness::start_with(|server| server).await
    }

    async fn start_with<F: FnOnce(Server) -> Server>(customize: F) -> Harness {
        Harness::start_with_store(|files| Arc::new(files) as Arc<dyn FileStore>, customize).await
    }

    async fn start_with_store<S, F>(store: S, customize: F) -> Harness
    where
        S: FnOnce(LocalFileStore) -> Arc<dyn FileStore>,
        F: FnOnce(Server) -> Server,
    {
        let project = tempfile::tempdir().expect("project dir");
        let storage = tempfile::tempdir().expect("storage dir");
        let files = store(LocalFileStore::new(project.path()).with_storage(storage.path()));
        let log = test_logger();
        let server = Server::new(ServerConfig::default(), files, Some(&log)).with_methods(test_methods());
        let server = Arc::new(customize(server));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(Arc::clone(&server).serve(listener));
        Harness {
            server,
            addr,
            project,
            storage,
        }
    }

    async fn client(&self, config: ClientConfig) -> Client {
        let log = test_logger();
        Client::connect(&self.addr, config, Some(&log))
            .await
            .expect("client connects")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn small_blocks(max_block_size: u64) -> ClientConfig {
    ClientConfig {
        max_block_size,
        ..ClientConfig::default()
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen::<u8>()).collect()
}

fn write_local(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, bytes).expect("write local file");
}

#[tokio::test(flavor = "multi_thread")]
async fn strings_round_trip() {
    let harness = Harness::start().await;
    let client = harness.client(ClientConfig::default()).await;
    let cancel = CancellationToken::new();

    client
        .save_strings(
            vec![
                (String::from("greeting"), String::from("hello")),
                (String::from("empty"), String::new()),
            ],
            &cancel,
        )
        .await
        .expect("save");
    let values = client
        .load_strings(
            vec![
                String::from("greeting"),
                String::from("never-saved"),
                String::from("empty"),
            ],
            &cancel,
        )
        .await
        .expect("load");
    assert_eq!(values, vec![String::from("hello"), String::new(), String::new()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_files_are_reported_in_place() {
    let harness = Harness::start().await;
    write_local(&harness.project.path().join("a.txt"), b"alpha");
    write_local(&harness.project.path().join("c.txt"), b"gamma!");
    let client = harness.client(ClientConfig::default()).await;

    let infos = client
        .files_info(
            Source::Project,
            vec![String::from("a.txt"), String::from("b.txt"), String::from("c.txt")],
            &CancellationToken::new(),
        )
        .await
        .expect("files info");
    assert_eq!(infos.len(), 3);
    assert_eq!(infos[0].size, 5);
    assert_eq!(infos[1].size, -1);
    assert!(!infos[1].exists());
    assert_eq!(infos[2].size, 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_then_download_in_groups() {
    let harness = Harness::start().await;
    let local = tempfile::tempdir().expect("local dir");
    let client = harness.client(small_blocks(1000)).await;
    let cancel = CancellationToken::new();

    let big = random_bytes(3500);
    let small = random_bytes(700);
    write_local(&local.path().join("big.bin"), &big);
    write_local(&local.path().join("small.bin"), &small);

    let mut uploaded = Vec::new();
    let summary = client
        .upload_files(
            &[
                (local.path().join("big.bin"), String::from("data/big.bin")),
                (local.path().join("small.bin"), String::from("data/small.bin")),
            ],
            Source::Project,
            |p: Progress| uploaded.push(p),
            &cancel,
        )
        .await
        .expect("upload");
    assert_eq!(summary.bytes, 4200);
    assert_eq!(summary.groups, 5);
    assert_eq!(uploaded.last().map(|p| p.so_far), Some(4200));
    assert_eq!(std::fs::read(harness.project.path().join("data/big.bin")).expect("read"), big);

    let target = local.path().join("copy/big.bin");
    let files = vec![
        (String::from("data/big.bin"), target.clone()),
        (String::from("data/small.bin"), local.path().join("copy/small.bin")),
    ];
    let mut reported = Vec::new();
    let options = TransferOptions {
        source: Source::Project,
        skip_if_up_to_date: true,
    };
    let summary = client
        .download_files(&files, &options, |p: Progress| reported.push(p), &cancel)
        .await
        .expect("download");
    assert!(!summary.already_downloaded);
    assert_eq!(summary.groups, 5);
    assert_eq!(std::fs::read(&target).expect("read"), big);
    assert_eq!(
        std::fs::read(local.path().join("copy/small.bin")).expect("read"),
        small
    );
    assert_eq!(reported.iter().map(|p| p.added).sum::<u64>(), 4200);
    assert!(reported.windows(2).all(|w| w[0].so_far < w[1].so_far));
    assert_eq!(reported.last().map(|p| p.percent), Some(100.0));

    let again = client
        .download_files(&files, &options, |_| (), &cancel)
        .await
        .expect("second download");
    assert!(again.already_downloaded);
    assert_eq!(again.groups, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_byte_file_downloads() {
    let harness = Harness::start().await;
    write_local(&harness.project.path().join("empty"), b"");
    let local = tempfile::tempdir().expect("local dir");
    let client = harness.client(ClientConfig::default()).await;

    let mut reported = Vec::new();
    let target = local.path().join("empty");
    client
        .download_files(
            &[(String::from("empty"), target.clone())],
            &TransferOptions::default(),
            |p: Progress| reported.push(p),
            &CancellationToken::new(),
        )
        .await
        .expect("download");
    assert_eq!(std::fs::metadata(&target).expect("created").len(), 0);
    let last = reported.last().expect("progress reported");
    assert_eq!(last.added, 0);
    assert_eq!(last.percent, 100.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_remote_file_fails_the_batch() {
    let harness = Harness::start().await;
    write_local(&harness.project.path().join("here"), b"x");
    let local = tempfile::tempdir().expect("local dir");
    let client = harness.client(ClientConfig::default()).await;

    let result = client
        .download_files(
            &[
                (String::from("here"), local.path().join("here")),
                (String::from("gone"), local.path().join("gone")),
            ],
            &TransferOptions::default(),
            |_| (),
            &CancellationToken::new(),
        )
        .await;
    match result {
        Err(Error::NotFound(msg)) => assert!(msg.contains("gone"), "{}", msg),
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert!(!local.path().join("here").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_paths_are_rejected() {
    let harness = Harness::start().await;
    let client = harness.client(ClientConfig::default()).await;

    let result = client
        .files_info(Source::Project, vec![String::from("../x")], &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::Validation(_))), "{:?}", result);
}

#[tokio::test(flavor = "multi_thread")]
async fn method_calls() {
    let harness = Harness::start().await;
    let client = harness.client(ClientConfig::default()).await;
    let cancel = CancellationToken::new();

    let sum: i64 = client
        .call_method("Math", "Add", &[json!(2), json!(40)], &cancel)
        .await
        .expect("add");
    assert_eq!(sum, 42);

    #[derive(Deserialize, Debug, PartialEq)]
    struct Size {
        w: i32,
        h: i32,
    }
    let size: Size = client
        .call_method("Geometry", "Size", &[], &cancel)
        .await
        .expect("size");
    assert_eq!(size, Size { w: 3, h: 4 });

    let catalog = client.call_methods(true, &cancel).await.expect("catalog");
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog["Admin"][0].method_name, "Reset");

    let unknown = client.call_method_value("Math", "Divide", &[], &cancel).await;
    assert!(matches!(unknown, Err(Error::NotFound(_))), "{:?}", unknown);
}

#[tokio::test(flavor = "multi_thread")]
async fn argument_count_mismatch_is_a_validation_error() {
    let harness = Harness::start().await;
    let client = harness.client(ClientConfig::default()).await;
    let cancel = CancellationToken::new();

    let descriptor = client
        .method_descriptor("Math", "Add", &cancel)
        .await
        .expect("descriptor");
    let result = client
        .call_method_by_id(descriptor.id, vec![json!(1), json!(2), json!(3)], &cancel)
        .await;
    assert!(matches!(result, Err(Error::Validation(_))), "{:?}", result);

    let local = client
        .call_method_value("Math", "Add", &[json!(1)], &cancel)
        .await;
    assert!(matches!(local, Err(Error::Validation(_))), "{:?}", local);
}

#[tokio::test(flavor = "multi_thread")]
async fn roles_gate_methods() {
    let harness = Harness::start().await;
    let cancel = CancellationToken::new();

    let user = harness.client(ClientConfig::default()).await;
    let denied = user.call_method_value("Admin", "Reset", &[], &cancel).await;
    assert!(matches!(denied, Err(Error::Unauthorized(_))), "{:?}", denied);

    let admin = harness
        .client(ClientConfig {
            role: Role::Admin,
            ..ClientConfig::default()
        })
        .await;
    let value = admin
        .call_method_value("Admin", "Reset", &[], &cancel)
        .await
        .expect("admin reset");
    assert_eq!(value, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_between_groups() {
    let harness = Harness::start().await;
    let local = tempfile::tempdir().expect("local dir");
    write_local(&local.path().join("big.bin"), &random_bytes(3000));
    let client = harness.client(small_blocks(1000)).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut groups_done = 0;
    let result = client
        .upload_files(
            &[(local.path().join("big.bin"), String::from("big.bin"))],
            Source::Project,
            |_| {
                groups_done += 1;
                trigger.cancel();
            },
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(Error::Canceled)), "{:?}", result);
    assert_eq!(groups_done, 1);
    let remote = std::fs::metadata(harness.project.path().join("big.bin")).expect("partial file");
    assert_eq!(remote.len(), 1000);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_slow_procedure() {
    let harness = Harness::start().await;
    let client = harness.client(ClientConfig::default()).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let result = client
        .call_method_value("Slow", "Wait", &[json!(10_000)], &cancel)
        .await;
    assert!(matches!(result, Err(Error::Canceled)), "{:?}", result);

    // The server drops the abandoned call and clears its entry.
    let mut cleared = false;
    for _ in 0..200 {
        if harness.server.cancellations().is_empty() {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared);

    let sum: i64 = client
        .call_method("Math", "Add", &[json!(1), json!(1)], &CancellationToken::new())
        .await
        .expect("connection still usable");
    assert_eq!(sum, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_completed_requests_is_harmless() {
    let harness = Harness::start().await;
    let client = harness.client(ClientConfig::default()).await;
    let cancel = CancellationToken::new();

    let ticket = client
        .send(&cloudfn_rpc::messages::Request::LoadStrings {
            keys: vec![String::from("k")],
        })
        .expect("send");
    let id = ticket.id();
    client.await_answer(ticket, &cancel).await.expect("answer");

    client.cancel_request(id).expect("first cancel");
    client.cancel_request(id).expect("second cancel");

    let values = client
        .load_strings(vec![String::from("k")], &cancel)
        .await
        .expect("still works");
    assert_eq!(values, vec![String::new()]);

    let already = CancellationToken::new();
    already.cancel();
    let result = client.load_strings(vec![String::from("k")], &already).await;
    assert!(matches!(result, Err(Error::Canceled)), "{:?}", result);
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_loss_fails_pending_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 16];
            let _ = socket.read(&mut buf).await;
        }
    });

    let client = Client::connect(&addr, ClientConfig::default(), None)
        .await
        .expect("connect");
    let result = client
        .load_strings(vec![String::from("k")], &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::ConnectionLost(_))), "{:?}", result);
    assert!(!client.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_download_mirrors() {
    let harness = Harness::start().await;
    let root = harness.project.path();
    write_local(&root.join("top/a.txt"), b"a");
    write_local(&root.join("top/sub/c.txt"), b"cc");

    let local = tempfile::tempdir().expect("local dir");
    write_local(&local.path().join("old.txt"), b"stale");
    write_local(&local.path().join("gone/x.txt"), b"stale");
    let client = harness.client(ClientConfig::default()).await;

    let options = DirectoryOptions {
        recursive: true,
        mirror: true,
        ..DirectoryOptions::default()
    };
    let summary = client
        .download_directory("top", local.path(), &options, |_| (), &CancellationToken::new())
        .await
        .expect("download directory");
    assert_eq!(summary.bytes, 3);
    assert_eq!(std::fs::read(local.path().join("a.txt")).expect("a"), b"a".to_vec());
    assert_eq!(std::fs::read(local.path().join("sub/c.txt")).expect("c"), b"cc".to_vec());
    assert!(!local.path().join("old.txt").exists());
    assert!(!local.path().join("gone").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_upload_mirrors() {
    let harness = Harness::start().await;
    let root = harness.project.path();
    write_local(&root.join("dest/stale.txt"), b"old");
    write_local(&root.join("dest/olddir/f.txt"), b"old");

    let local = tempfile::tempdir().expect("local dir");
    write_local(&local.path().join("one.txt"), b"1");
    write_local(&local.path().join("nested/two.txt"), b"22");
    let client = harness.client(ClientConfig::default()).await;

    let options = DirectoryOptions {
        recursive: true,
        mirror: true,
        ..DirectoryOptions::default()
    };
    client
        .upload_directory(local.path(), "dest", &options, |_| (), &CancellationToken::new())
        .await
        .expect("upload directory");
    assert_eq!(std::fs::read(root.join("dest/one.txt")).expect("one"), b"1".to_vec());
    assert_eq!(std::fs::read(root.join("dest/nested/two.txt")).expect("two"), b"22".to_vec());
    assert!(!root.join("dest/stale.txt").exists());
    assert!(!root.join("dest/olddir").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn read_only_policy_denies_writes() {
    let harness = Harness::start_with(|server| server.with_policy(Arc::new(ReadOnly))).await;
    write_local(&harness.project.path().join("r.txt"), b"r");
    let local = tempfile::tempdir().expect("local dir");
    write_local(&local.path().join("w.txt"), b"w");
    let client = harness.client(ClientConfig::default()).await;
    let cancel = CancellationToken::new();

    let denied = client
        .upload_files(
            &[(local.path().join("w.txt"), String::from("w.txt"))],
            Source::Project,
            |_| (),
            &cancel,
        )
        .await;
    assert!(matches!(denied, Err(Error::Unauthorized(_))), "{:?}", denied);
    assert!(!harness.project.path().join("w.txt").exists());

    let infos = client
        .files_info(Source::Project, vec![String::from("r.txt")], &cancel)
        .await
        .expect("reads still allowed");
    assert!(infos[0].exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn storage_source_uses_content_urls() {
    let harness = Harness::start().await;
    let local = tempfile::tempdir().expect("local dir");
    let content = random_bytes(2048);
    write_local(&local.path().join("blob"), &content);
    let client = harness.client(small_blocks(100)).await;
    let cancel = CancellationToken::new();

    let up = client
        .upload_files(
            &[(local.path().join("blob"), String::from("bucket/blob"))],
            Source::Storage,
            |_| (),
            &cancel,
        )
        .await
        .expect("upload to storage");
    assert_eq!(up.bytes, 2048);
    assert_eq!(up.groups, 0);
    assert_eq!(std::fs::read(harness.storage.path().join("bucket/blob")).expect("stored"), content);

    let back = local.path().join("back/blob");
    let options = TransferOptions {
        source: Source::Storage,
        skip_if_up_to_date: false,
    };
    let down = client
        .download_files(&[(String::from("bucket/blob"), back.clone())], &options, |_| (), &cancel)
        .await
        .expect("download from storage");
    assert_eq!(down.bytes, 2048);
    assert_eq!(std::fs::read(&back).expect("fetched"), content);
}

/// Serves everything from a local store but drops the last byte of every
/// block it reads.
struct ShortReads(LocalFileStore);

impl FileStore for ShortReads {
    fn files_info(&self, source: Source, paths: &[String]) -> Result<Vec<FileInfo>, Fault> {
        self.0.files_info(source, paths)
    }

    fn directory_info(
        &self,
        source: Source,
        path: &str,
        pattern: &str,
        recursive: bool,
        stop: &dyn Fn() -> bool,
    ) -> Result<Vec<DirectoryEntry>, Fault> {
        self.0.directory_info(source, path, pattern, recursive, stop)
    }

    fn read_range(&self, source: Source, part: &TransferPart) -> Result<Vec<u8>, Fault> {
        let mut block = self.0.read_range(source, part)?;
        block.pop();
        Ok(block)
    }

    fn write_range(&self, source: Source, part: &TransferPart, bytes: &[u8]) -> Result<(), Fault> {
        self.0.write_range(source, part, bytes)
    }

    fn create_directory(&self, source: Source, path: &str) -> Result<(), Fault> {
        self.0.create_directory(source, path)
    }

    fn delete_files(&self, source: Source, paths: &[String]) -> Result<(), Fault> {
        self.0.delete_files(source, paths)
    }

    fn delete_directory(&self, source: Source, path: &str, recursive: bool, clear: bool) -> Result<(), Fault> {
        self.0.delete_directory(source, path, recursive, clear)
    }

    fn content_url(&self, source: Source, path: &str, upload: bool) -> Result<String, Fault> {
        self.0.content_url(source, path, upload)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn short_blocks_fail_the_download() {
    let harness =
        Harness::start_with_store(|files| Arc::new(ShortReads(files)) as Arc<dyn FileStore>, |server| {
            server
        })
        .await;
    write_local(&harness.project.path().join("f.bin"), &random_bytes(2500));
    let local = tempfile::tempdir().expect("local dir");
    let client = harness.client(small_blocks(1000)).await;

    let result = client
        .download_files(
            &[(String::from("f.bin"), local.path().join("f.bin"))],
            &TransferOptions::default(),
            |_| (),
            &CancellationToken::new(),
        )
        .await;
    match result {
        Err(Error::Protocol(msg)) => assert!(msg.contains("arrived with 999 bytes"), "{}", msg),
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

/// Answers file info for a 5-byte file, then every content request with
/// no blocks at all.
async fn serve_missing_blocks(listener: TcpListener) {
    let socket = match listener.accept().await {
        Ok((socket, _)) => socket,
        Err(_) => return,
    };
    let mut framed = Framed::new(socket, MessageCodec::new(DEFAULT_MAX_FRAME_SIZE));
    while let Some(Ok(msg)) = framed.next().await {
        if msg.status != MessageStatus::Request {
            continue;
        }
        let body = match msg.name() {
            "get_files_info" => AnswerBody::FilesInfo {
                files: vec![FileInfo {
                    size: 5,
                    hash: String::from("0000"),
                    last_modified: None,
                }],
            },
            _ => AnswerBody::Content { blocks: Vec::new() },
        };
        let d = serde_json::to_value(&Answer { error: None, body }).expect("encode answer");
        if framed.send(Message::answer(msg.id, msg.name(), d)).await.is_err() {
            break;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_blocks_fail_the_download() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve_missing_blocks(listener));

    let local = tempfile::tempdir().expect("local dir");
    let client = Client::connect(&addr, ClientConfig::default(), None)
        .await
        .expect("connect");
    let result = client
        .download_files(
            &[(String::from("five"), local.path().join("five"))],
            &TransferOptions::default(),
            |_| (),
            &CancellationToken::new(),
        )
        .await;
    match result {
        Err(Error::Protocol(msg)) => assert!(msg.contains("asked for 1 parts, received 0"), "{}", msg),
        other => panic!("expected a protocol error, got {:?}", other),
    }
    assert!(!local.path().join("five").exists());
}

static FILE_URLS: FileUrlTransport = FileUrlTransport;

/// Copies like `FileUrlTransport` but reports one byte less than it stored.
struct UnderReporting;

impl ContentTransport for UnderReporting {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, io::Result<u64>> {
        FILE_URLS.fetch(url, dest)
    }

    fn store<'a>(&'a self, src: &'a Path, url: &'a str) -> BoxFuture<'a, io::Result<u64>> {
        Box::pin(async move {
            let stored = FILE_URLS.store(src, url).await?;
            Ok(stored.saturating_sub(1))
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_storage_upload_is_a_protocol_error() {
    let harness = Harness::start().await;
    let local = tempfile::tempdir().expect("local dir");
    write_local(&local.path().join("blob"), &random_bytes(512));
    let client = harness
        .client(ClientConfig::default())
        .await
        .with_content_transport(Arc::new(UnderReporting));

    let result = client
        .upload_files(
            &[(local.path().join("blob"), String::from("bucket/blob"))],
            Source::Storage,
            |_| (),
            &CancellationToken::new(),
        )
        .await;
    match result {
        Err(Error::Protocol(msg)) => assert!(msg.contains("stored 511 bytes, expected 512"), "{}", msg),
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_aborts_running_procedures() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let methods = MethodRegistry::from_candidates(vec![MethodCandidate::new(
        "Ticker",
        "Run",
        move |_ctx: CallContext, _args: Vec<Value>| {
            let counter = Arc::clone(&counter);
            async move {
                // Never looks at its cancellation state.
                while counter.fetch_add(1, Ordering::SeqCst) < 100_000 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok::<Value, ProcedureError>(Value::Null)
            }
        },
    )])
    .expect("ticker registers");
    let harness = Harness::start_with(|server| server.with_methods(methods)).await;
    let client = harness.client(ClientConfig::default()).await;

    let call = tokio::spawn(async move {
        client
            .call_method_value("Ticker", "Run", &[], &CancellationToken::new())
            .await
    });
    for _ in 0..200 {
        if ticks.load(Ordering::SeqCst) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ticks.load(Ordering::SeqCst) >= 3);

    // Dropping the call drops the client and closes the connection.
    call.abort();
    let _ = call.await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after_close = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        ticks.load(Ordering::SeqCst) <= after_close + 1,
        "procedure kept running: {} -> {}",
        after_close,
        ticks.load(Ordering::SeqCst)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_serving() {
    let root = tempfile::tempdir().expect("root dir");
    let server = Arc::new(Server::new(
        ServerConfig::default(),
        Arc::new(LocalFileStore::new(root.path())),
        None,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
    let serving = tokio::spawn(Arc::clone(&server).serve(listener));

    server.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("serve returns after shutdown")
        .expect("serve task");
    assert!(result.is_ok());
}

#[tokio::main]
async fn run_server(root: PathBuf, ready: std_mpsc::Sender<SocketAddr>) {
    let log = test_logger();
    let server = Arc::new(Server::new(
        ServerConfig::default(),
        Arc::new(LocalFileStore::new(root)),
        Some(&log),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
    let addr = listener.local_addr().expect("local addr");
    let _ = ready.send(addr);
    let _ = server.serve(listener).await;
}

async fn run_client(addr: SocketAddr) -> Result<(), Error> {
    let client = Client::connect(&addr, ClientConfig::default(), None).await?;
    let cancel = CancellationToken::new();
    for i in 1..50 {
        let value = "a".repeat(i * 1000);
        client
            .save_strings(vec![(format!("key{}", i), value.clone())], &cancel)
            .await?;
        let loaded = client.load_strings(vec![format!("key{}", i)], &cancel).await?;
        assert_eq!(loaded, vec![value]);
    }
    Ok(())
}

#[test]
fn client_server_comms() {
    let root = tempfile::tempdir().expect("root dir");
    let (tx, rx) = std_mpsc::channel();
    let server_root = root.path().to_path_buf();
    let _h_server = thread::spawn(move || run_server(server_root, tx));

    let addr = rx.recv().expect("server address");
    assert!(block_on(run_client(addr)).is_ok());
}
