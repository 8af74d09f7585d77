//! Cookie-file discovery for authenticated fetching.

use std::path::{Path, PathBuf};

use crate::config::ENV_PREFIX;

const COOKIES_FILE: &str = "cookies.txt";

/// Find a Netscape-format cookie file.
///
/// `SPACE_WATCHER_COOKIES_PATH` wins when it names an existing file;
/// otherwise `cookies.txt` and `bin/cookies.txt` are tried next to the
/// executable, then in the working directory.
pub fn find_cookies_file() -> Option<PathBuf> {
    let explicit = std::env::var_os(format!("{ENV_PREFIX}COOKIES_PATH")).map(PathBuf::from);
    let mut roots = Vec::new();
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        roots.push(dir);
    }
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    find_in(explicit.as_deref(), &roots)
}

/// Search `explicit` first, then `<root>/cookies.txt` and
/// `<root>/bin/cookies.txt` for every root in order.
pub fn find_in(explicit: Option<&Path>, roots: &[PathBuf]) -> Option<PathBuf> {
    if let Some(path) = explicit.filter(|p| p.is_file()) {
        return Some(path.to_path_buf());
    }
    roots
        .iter()
        .flat_map(|root| [root.join(COOKIES_FILE), root.join("bin").join(COOKIES_FILE)])
        .find(|p| p.is_file())
}
