use std::sync::Arc;

use dirsync_core::protocol::{FileSelector, content_digest};
use dirsync_core::{ClientError, ConnectionManager, ProtocolClient, ServerAddress};
use dirsync_server::config::{Credentials, Limits};
use dirsync_server::context::ServerContext;
use dirsync_server::dispatcher::Dispatcher;
use dirsync_server::storage::StorageManager;
use dirsync_server::store::MetadataStore;
use tempfile::{TempDir, tempdir};
use tokio::net::TcpListener;

struct TestServer {
    ctx: Arc<ServerContext>,
    address: ServerAddress,
    _dir: TempDir,
}

async fn start_server() -> TestServer {
    start_server_with_limits(Limits::default()).await
}

async fn start_server_with_limits(limits: Limits) -> TestServer {
    let dir = tempdir().unwrap();
    let store = MetadataStore::new("sqlite::memory:").await.unwrap();
    let storage = StorageManager::new(dir.path().join("storage")).unwrap();
    let ctx = Arc::new(ServerContext {
        store,
        storage,
        limits,
        credentials: Credentials {
            username: "alice".into(),
            password: "pw".into(),
        },
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(dirsync_server::server::serve(
        listener,
        Arc::clone(&ctx),
        Arc::new(Dispatcher::default()),
    ));
    TestServer {
        ctx,
        address: ServerAddress::new("127.0.0.1", port),
        _dir: dir,
    }
}

fn client_for(server: &TestServer) -> ProtocolClient {
    ProtocolClient::new(Arc::new(ConnectionManager::new())).with_address(server.address.clone())
}

#[tokio::test]
async fn login_gates_on_credentials() {
    let server = start_server().await;
    let client = client_for(&server);

    client.login("alice", "pw").await.unwrap();
    let err = client.login("alice", "wrong").await.unwrap_err();
    assert!(matches!(err, ClientError::Server(_)));
    // error responses keep the connection usable
    client.login("alice", "pw").await.unwrap();
}

#[tokio::test]
async fn create_upload_list_download_over_one_connection() {
    let server = start_server().await;
    let client = client_for(&server);
    client.login("alice", "pw").await.unwrap();

    let folder = client.create_folder("Reports", None).await.unwrap();
    assert!(server.ctx.storage.root().join("Reports").is_dir());

    let work = tempdir().unwrap();
    let source = work.path().join("hello.txt");
    std::fs::write(&source, b"hello").unwrap();
    let uploaded = client.upload(&source, folder.folder_id).await.unwrap();
    assert_eq!(uploaded.file_size, 5);
    assert_eq!(uploaded.file_hash, content_digest(b"hello"));

    let files = client.get_file_list(folder.folder_id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "hello.txt");

    let target = work.path().join("copy.txt");
    let downloaded = client
        .download_to(&FileSelector::by_name(folder.folder_id, "hello.txt"), &target)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"hello");
    assert_eq!(downloaded.file_hash, uploaded.file_hash);

    let tree = client.get_folder_tree(None).await.unwrap();
    assert_eq!(tree[0].children[0].name, "Reports");
}

#[tokio::test]
async fn non_recursive_delete_of_populated_folder_fails() {
    let server = start_server().await;
    let client = client_for(&server);
    let folder = client.create_folder("Docs", None).await.unwrap();
    let work = tempdir().unwrap();
    let source = work.path().join("a.txt");
    std::fs::write(&source, b"a").unwrap();
    client.upload(&source, folder.folder_id).await.unwrap();

    let err = client.delete_folder(folder.folder_id, false).await.unwrap_err();
    assert!(err.to_string().contains("not empty"));
    assert!(server.ctx.storage.root().join("Docs/a.txt").exists());

    client.delete_folder(folder.folder_id, true).await.unwrap();
    assert!(!server.ctx.storage.root().join("Docs").exists());
}

#[tokio::test]
async fn concurrent_callers_share_one_ordered_connection() {
    let server = start_server().await;
    let client = client_for(&server);
    let root = server.ctx.store.ensure_root().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.create_folder(&format!("folder-{i}"), None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let counts = server.ctx.store.count_children(root.id).await.unwrap();
    assert_eq!(counts.folders, 8);
}

#[tokio::test]
async fn malformed_lines_get_error_responses() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let server = start_server().await;
    let socket = tokio::net::TcpStream::connect(server.address.to_string())
        .await
        .unwrap();
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"this is not json\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.contains("\"status\":\"error\""));

    write
        .write_all(b"{\"action\":\"NOPE\",\"data\":{}}\n")
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.contains("Unknown action: NOPE"));
}

#[tokio::test]
async fn oversized_request_line_is_refused_and_connection_closed() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let server = start_server_with_limits(Limits {
        max_upload_bytes: 16,
        max_download_bytes: 16,
    })
    .await;
    let socket = tokio::net::TcpStream::connect(server.address.to_string())
        .await
        .unwrap();
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();

    let mut request = b"{\"action\":\"UPLOAD_FILE\",\"data\":{\"fileContent\":\"".to_vec();
    request.extend(std::iter::repeat_n(b'A', 10_000));
    request.extend_from_slice(b"\"}}\n");
    write.write_all(&request).await.unwrap();

    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.contains("\"status\":\"error\""));
    assert!(reply.contains("Request too large"));
    // nothing further is served on this connection
    assert!(!matches!(lines.next_line().await, Ok(Some(_))));
    assert!(server.ctx.storage.root().read_dir().unwrap().next().is_none());
}
