// Utility Functions
// Workspace discovery and path helpers shared by config and execution

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Walk up from `start` to the directory holding `.git`.
///
/// Returns `None` when `start` does not exist or sits outside any repository.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Default workspace: the enclosing repository, else the current directory
pub fn resolve_working_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd).unwrap_or(cwd)
}

/// Directory a step runs in.
///
/// Relative `working-directory` values are joined onto the workspace,
/// absolute ones are used as given.
pub fn step_directory(workspace: &Path, working_directory: Option<&str>) -> PathBuf {
    match working_directory.map(str::trim) {
        None | Some("") | Some(".") => workspace.to_path_buf(),
        Some(dir) => {
            let dir = Path::new(dir);
            if dir.is_absolute() {
                dir.to_path_buf()
            } else {
                workspace.join(dir)
            }
        }
    }
}

/// `timeout-minutes` as a duration
pub fn minutes(value: u32) -> Duration {
    Duration::from_secs(u64::from(value) * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn test_find_repo_root_from_nested_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join(".git")).unwrap();
        let sub = root.join("crates").join("engine").join("src");
        fs::create_dir_all(&sub).unwrap();

        let found = find_repo_root(&sub).unwrap();
        assert_eq!(found, root.canonicalize().unwrap());
        assert_eq!(find_repo_root(root).unwrap(), root.canonicalize().unwrap());
    }

    #[test]
    fn test_find_repo_root_missing_path() {
        assert!(find_repo_root(Path::new("/nonexistent/workflow/engine/path")).is_none());
    }

    #[test]
    fn test_step_directory() {
        let workspace = Path::new("/work");
        assert_eq!(step_directory(workspace, None), PathBuf::from("/work"));
        assert_eq!(step_directory(workspace, Some(".")), PathBuf::from("/work"));
        assert_eq!(
            step_directory(workspace, Some("web/app")),
            PathBuf::from("/work/web/app")
        );
        assert_eq!(step_directory(workspace, Some("/opt")), PathBuf::from("/opt"));
    }

    #[test]
    fn test_minutes() {
        assert_eq!(minutes(2), Duration::from_secs(120));
    }
}
