use super::*;
use dirsync_core::protocol::{Request, Response, decode_line, encode_line};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[test]
fn expands_tilde_to_home_sync_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/DirSync", &home),
        PathBuf::from("/tmp/home-user/DirSync")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/srv/sync", &home), PathBuf::from("/srv/sync"));
}

#[test]
fn reads_numbers_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
    assert_eq!(read_string_env("NO_SUCH_STRING_ENV_FOR_TEST"), None);
}

fn folder(id: i64, name: &str, children: Vec<FolderNode>) -> FolderNode {
    FolderNode {
        id,
        name: name.into(),
        icon: "📁".into(),
        parent_id: None,
        created: String::new(),
        modified: String::new(),
        children,
    }
}

#[test]
fn renders_nested_tree_with_indentation() {
    let tree = vec![folder(2, "Docs", vec![folder(3, "Inner", Vec::new())])];
    assert_eq!(render_tree(&tree), "📁 Docs (id 2)\n  📁 Inner (id 3)\n");
}

#[test]
fn renders_file_rows() {
    let files = vec![FileEntry {
        id: 7,
        name: "a.txt".into(),
        icon: "📝".into(),
        size: 5,
        size_display: "5 B".into(),
        hash: "h".into(),
        created: "2024-01-01 00:00:00".into(),
        modified: "2024-01-02 00:00:00".into(),
    }];
    assert_eq!(
        render_file_list(&files),
        "📝 a.txt\t5 B\t2024-01-02 00:00:00\t(id 7)\n"
    );
}

#[test]
fn describes_status_for_logs() {
    let status = SyncStatus::Failed {
        path: "a.txt".into(),
        error: "boom".into(),
    };
    assert_eq!(describe_status(&status), "a.txt: failed: boom");
}

async fn login_server(accept_password: &'static str) -> ServerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Request = decode_line(&line).unwrap();
            let response = if request.data["password"] == accept_password {
                Response::success("Login successful", json!({}))
            } else {
                Response::error("Access denied: invalid username or password")
            };
            let out = encode_line(&response).unwrap();
            write.write_all(format!("{out}\n").as_bytes()).await.unwrap();
        }
    });
    ServerAddress::new("127.0.0.1", port)
}

fn config_for(address: ServerAddress, password: Option<&str>) -> DaemonConfig {
    DaemonConfig {
        address,
        username: Some("admin".into()),
        password: password.map(str::to_string),
        sync_root: PathBuf::from("/tmp/unused"),
        folder_id: 1,
        debounce: DEFAULT_DEBOUNCE,
        pacing: DEFAULT_PACING,
        max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
    }
}

#[tokio::test]
async fn bootstrap_logs_in_before_returning() {
    let address = login_server("secret").await;
    let runtime = DaemonRuntime::bootstrap(config_for(address, Some("secret")))
        .await
        .unwrap();
    assert!(runtime.client().connection().is_connected().await);
}

#[tokio::test]
async fn bootstrap_fails_on_rejected_login() {
    let address = login_server("secret").await;
    let err = DaemonRuntime::bootstrap(config_for(address, Some("wrong")))
        .await
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("Access denied"));
}

#[tokio::test]
async fn bootstrap_requires_credentials() {
    let address = login_server("secret").await;
    let err = DaemonRuntime::bootstrap(config_for(address, None))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("DIRSYNC_PASSWORD"));
}
