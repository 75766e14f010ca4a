fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn describe_status(status: &SyncStatus) -> String {
    match status {
        SyncStatus::Queued { path, operation } => format!("{path}: queued ({operation:?})"),
        SyncStatus::InFlight { path } => format!("{path}: uploading"),
        SyncStatus::Synced { path } => format!("{path}: synced"),
        SyncStatus::Failed { path, error } => format!("{path}: failed: {error}"),
    }
}

/// Indented folder listing, one folder per line.
pub fn render_tree(nodes: &[FolderNode]) -> String {
    fn walk(nodes: &[FolderNode], depth: usize, out: &mut String) {
        for node in nodes {
            out.push_str(&"  ".repeat(depth));
            out.push_str(&format!("{} {} (id {})\n", node.icon, node.name, node.id));
            walk(&node.children, depth + 1, out);
        }
    }
    let mut out = String::new();
    walk(nodes, 0, &mut out);
    out
}

pub fn render_file_list(files: &[FileEntry]) -> String {
    files
        .iter()
        .map(|file| {
            format!(
                "{} {}\t{}\t{}\t(id {})\n",
                file.icon, file.name, file.size_display, file.modified, file.id
            )
        })
        .collect()
}
