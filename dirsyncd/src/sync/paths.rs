use std::path::{Component, Path};

const TEMP_SUFFIXES: [&str; 2] = [".tmp", ".swp"];

pub fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

pub fn is_ignored(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(part) => is_ignored_name(&part.to_string_lossy()),
        _ => false,
    })
}

pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
