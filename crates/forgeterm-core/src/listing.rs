use crate::path::{file_name_remote, join_remote, normalize_remote};
use chrono::{Local, TimeZone};
use forgeterm_ssh::{FileKind, RemoteEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    File,
    Directory,
    Symlink,
    /// The synthetic `..` entry of a listing.
    ParentMarker,
}

impl From<FileKind> for ItemKind {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::Directory => ItemKind::Directory,
            FileKind::Symlink => ItemKind::Symlink,
            FileKind::File => ItemKind::File,
        }
    }
}

impl ItemKind {
    pub fn label(self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Directory | ItemKind::ParentMarker => "directory",
            ItemKind::Symlink => "link",
        }
    }

    fn sort_group(self) -> u8 {
        match self {
            ItemKind::ParentMarker => 0,
            ItemKind::Directory => 1,
            ItemKind::File | ItemKind::Symlink => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteItem {
    pub name: String,
    pub path: String,
    pub kind: ItemKind,
    pub size: u64,
    pub modified: String,
    pub permissions: String,
}

impl RemoteItem {
    pub fn from_entry(dir: &str, entry: &RemoteEntry) -> Self {
        let meta = &entry.metadata;
        Self {
            name: entry.name.clone(),
            path: join_remote(dir, &entry.name),
            kind: meta.kind().into(),
            size: meta.size,
            modified: format_mtime(meta.mtime),
            permissions: format_permissions(meta.mode),
        }
    }

    pub fn parent(path: impl Into<String>) -> Self {
        Self {
            name: "..".to_string(),
            path: path.into(),
            kind: ItemKind::ParentMarker,
            size: 0,
            modified: String::new(),
            permissions: String::new(),
        }
    }

    /// An item picked by path alone, e.g. from a command line.
    pub fn selected(path: &str, kind: ItemKind) -> Self {
        let path = normalize_remote(path);
        Self {
            name: file_name_remote(&path).to_string(),
            path,
            kind,
            size: 0,
            modified: String::new(),
            permissions: String::new(),
        }
    }

    pub fn file(path: &str) -> Self {
        Self::selected(path, ItemKind::File)
    }

    pub fn directory(path: &str) -> Self {
        Self::selected(path, ItemKind::Directory)
    }

    pub fn is_parent(&self) -> bool {
        self.kind == ItemKind::ParentMarker
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ItemKind::Directory
    }
}

/// `..` first, then directories, then everything else; names case-insensitive.
pub fn sort_items(items: &mut [RemoteItem]) {
    items.sort_by_cached_key(|item| (item.kind.sort_group(), item.name.to_lowercase()));
}

const TRIPLETS: [&str; 8] = ["---", "--x", "-w-", "-wx", "r--", "r-x", "rw-", "rwx"];

/// `ls -l` style mode string, e.g. `drwxr-xr-x`.
pub fn format_permissions(mode: u32) -> String {
    let type_char = match FileKind::from_mode(mode) {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::File => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6, 3, 0] {
        out.push_str(TRIPLETS[((mode >> shift) & 0o7) as usize]);
    }
    out
}

pub fn format_mtime(mtime: Option<u64>) -> String {
    mtime
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| Local.timestamp_opt(secs, 0).single())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

const TEXT_EXTENSIONS: &[&str] = &[
    ".txt", ".py", ".js", ".html", ".css", ".json", ".xml", ".md", ".ini", ".conf", ".cfg",
    ".log", ".sh", ".bash", ".php", ".c", ".cpp", ".h", ".java", ".yaml", ".yml", ".toml",
    ".csv", ".lua",
];

/// Extension check used to decide whether a file may be opened as text.
pub fn is_text_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    TEXT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}
