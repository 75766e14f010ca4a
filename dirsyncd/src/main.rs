use std::path::PathBuf;

use anyhow::Context;
use dirsync_core::protocol::FileSelector;
use dirsyncd::daemon::{DaemonConfig, DaemonRuntime, render_file_list, render_tree};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: dirsyncd [COMMAND]

Without a command the sync agent runs until interrupted.

Commands:
  tree [parentId]                  Print the remote folder tree
  ls <folderId>                    List files in a remote folder
  mkdir <name> [parentId]          Create a remote folder
  upload <file> <folderId>         Upload one file
  download <name> <folderId> <out> Download a file by name
  --help                           Show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Help,
    Tree { parent_id: Option<i64> },
    List { folder_id: i64 },
    Mkdir { name: String, parent_id: Option<i64> },
    Upload { file: PathBuf, folder_id: i64 },
    Download { name: String, folder_id: i64, out: PathBuf },
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        return Ok(CliMode::Run);
    };
    let mode = match (command.as_str(), rest) {
        ("--help" | "-h", []) => CliMode::Help,
        ("tree", []) => CliMode::Tree { parent_id: None },
        ("tree", [parent]) => CliMode::Tree {
            parent_id: Some(parse_id(parent)?),
        },
        ("ls", [folder]) => CliMode::List {
            folder_id: parse_id(folder)?,
        },
        ("mkdir", [name]) => CliMode::Mkdir {
            name: name.clone(),
            parent_id: None,
        },
        ("mkdir", [name, parent]) => CliMode::Mkdir {
            name: name.clone(),
            parent_id: Some(parse_id(parent)?),
        },
        ("upload", [file, folder]) => CliMode::Upload {
            file: PathBuf::from(file),
            folder_id: parse_id(folder)?,
        },
        ("download", [name, folder, out]) => CliMode::Download {
            name: name.clone(),
            folder_id: parse_id(folder)?,
            out: PathBuf::from(out),
        },
        (other, _) => anyhow::bail!("unknown or incomplete command: {other} (see --help)"),
    };
    Ok(mode)
}

fn parse_id(value: &str) -> anyhow::Result<i64> {
    value
        .parse::<i64>()
        .with_context(|| format!("invalid folder id: {value}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dirsyncd=info")),
        )
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    if mode == CliMode::Run {
        return daemon.run().await;
    }
    let client = daemon.client();
    match mode {
        CliMode::Run | CliMode::Help => {}
        CliMode::Tree { parent_id } => {
            let tree = client
                .get_folder_tree(parent_id)
                .await
                .context("failed to load folder tree")?;
            print!("{}", render_tree(&tree));
        }
        CliMode::List { folder_id } => {
            let files = client
                .get_file_list(folder_id)
                .await
                .context("failed to list files")?;
            print!("{}", render_file_list(&files));
        }
        CliMode::Mkdir { name, parent_id } => {
            let created = client
                .create_folder(&name, parent_id)
                .await
                .context("failed to create folder")?;
            println!("created {} (id {})", created.folder_name, created.folder_id);
        }
        CliMode::Upload { file, folder_id } => {
            let uploaded = client
                .upload(&file, folder_id)
                .await
                .with_context(|| format!("failed to upload {}", file.display()))?;
            println!(
                "uploaded {} ({} bytes, sha256 {})",
                file.display(),
                uploaded.file_size,
                uploaded.file_hash
            );
        }
        CliMode::Download {
            name,
            folder_id,
            out,
        } => {
            let downloaded = client
                .download_to(&FileSelector::by_name(folder_id, name), &out)
                .await
                .context("failed to download file")?;
            println!(
                "downloaded {} to {} ({} bytes)",
                downloaded.file_name,
                out.display(),
                downloaded.file_size
            );
        }
    }
    client.connection().disconnect().await;
    Ok(())
}
