//! Server-side registry of open uploads
//!
//! Maps file tokens to open descriptors plus the forwarding targets a
//! SET_CHAIN installed for them. All operations return negated errno
//! codes on failure, which is the currency the wire protocol's `error`
//! field speaks.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::CHUNK_BASE;
use crate::target::ChainTarget;

pub struct FileInfo {
    pub file: Arc<File>,
    pub chunk_size: u32,
    pub total_size: u64,
    pub file_path: PathBuf,
    pub file_token: String,
    pub chain_targets: Vec<ChainTarget>,
}

/// Resolve a remote-supplied `relative_path` + `file_name` under a
/// partition root. Anything that could climb out of the root (parent
/// components, absolute components, NUL bytes) is rejected.
pub fn resolve_under_root(root: &Path, relative_path: &str, file_name: &str) -> Result<PathBuf, i32> {
    let mut resolved = root.to_path_buf();

    for part in [relative_path, file_name] {
        if part.contains('\0') {
            return Err(-libc::EINVAL);
        }
        for component in Path::new(part).components() {
            match component {
                Component::CurDir => {}
                Component::Normal(s) => resolved.push(s),
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(-libc::EINVAL);
                }
            }
        }
    }

    if !resolved.starts_with(root) || resolved == root {
        return Err(-libc::EINVAL);
    }

    Ok(resolved)
}

fn mint_token(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

pub struct FileManager {
    fmap: Mutex<HashMap<String, FileInfo>>,
}

impl Default for FileManager {
    fn default() -> FileManager {
        FileManager::new()
    }
}

impl FileManager {
    pub fn new() -> FileManager {
        FileManager {
            fmap: Mutex::new(HashMap::new()),
        }
    }

    /// Open `path` for writing, truncate it, and register a token for
    /// it. Blocking; callers on the async side offload this.
    pub fn create_file(
        &self,
        path: &Path,
        total_size: u64,
        chunk_size: u32,
        file_perm: u32,
        direct_io: bool,
    ) -> Result<String, i32> {
        if chunk_size == 0 || chunk_size as usize % CHUNK_BASE != 0 {
            return Err(-libc::EINVAL);
        }

        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return Err(-libc::ENOTDIR);
            }
        }

        let mut opts = std::fs::OpenOptions::new();
        opts.create(true).read(true).write(true);
        opts.mode(if file_perm != 0 { file_perm } else { 0o660 });
        if direct_io {
            opts.custom_flags(libc::O_DIRECT);
        }

        let file = match opts.open(path) {
            Ok(file) => file,
            Err(e) => return Err(-e.raw_os_error().unwrap_or(libc::EIO)),
        };
        if let Err(e) = file.set_len(0) {
            return Err(-e.raw_os_error().unwrap_or(libc::EIO));
        }

        let token = mint_token(path);
        let info = FileInfo {
            file: Arc::new(file),
            chunk_size,
            total_size,
            file_path: path.to_path_buf(),
            file_token: token.clone(),
            chain_targets: Vec::new(),
        };

        let mut fmap = self.fmap.lock();
        if fmap.contains_key(&token) {
            return Err(-libc::EEXIST);
        }
        fmap.insert(token.clone(), info);

        Ok(token)
    }

    /// Remove the entry, restore the exact file size, and close the
    /// descriptor. Blocking, like `create_file`.
    pub fn close_file(&self, file_token: &str) -> i32 {
        let info = {
            let mut fmap = self.fmap.lock();
            match fmap.remove(file_token) {
                Some(info) => info,
                None => return -libc::ENOENT,
            }
        };

        // Trim the direct-I/O padding from the final chunk.
        if let Err(e) = info.file.set_len(info.total_size) {
            return -e.raw_os_error().unwrap_or(libc::EIO);
        }
        0
    }

    pub fn has_file(&self, file_token: &str) -> bool {
        self.fmap.lock().contains_key(file_token)
    }

    pub fn set_chain_targets(&self, file_token: &str, targets: Vec<ChainTarget>) -> i32 {
        let mut fmap = self.fmap.lock();
        match fmap.get_mut(file_token) {
            Some(info) => {
                info.chain_targets = targets;
                0
            }
            None => -libc::ENOENT,
        }
    }

    /// Snapshot the descriptor and forwarding targets for one chunk.
    /// The `Arc<File>` stays valid through a concurrent close; the map
    /// entry just becomes unreachable.
    pub fn get_file(&self, file_token: &str) -> Option<(Arc<File>, Vec<ChainTarget>)> {
        let fmap = self.fmap.lock();
        fmap.get(file_token)
            .map(|info| (info.file.clone(), info.chain_targets.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;

    fn create(mng: &FileManager, root: &Path, name: &str, size: u64) -> String {
        let path = resolve_under_root(root, ".", name).unwrap();
        mng.create_file(&path, size, 8192, 0, false).unwrap()
    }

    #[test]
    fn create_write_close_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mng = FileManager::new();

        let token = create(&mng, dir.path(), "a.bin", 5);
        assert!(mng.has_file(&token));

        let (file, targets) = mng.get_file(&token).unwrap();
        assert!(targets.is_empty());
        file.write_all_at(&[1u8; 8192], 0).unwrap();

        assert_eq!(mng.close_file(&token), 0);
        assert!(!mng.has_file(&token));

        // Close trims the chunk padding back to the declared size.
        let written = std::fs::read(dir.path().join("a.bin")).unwrap();
        assert_eq!(written, vec![1u8; 5]);
    }

    #[test]
    fn chunk_size_must_be_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let mng = FileManager::new();
        let path = dir.path().join("x");

        assert_eq!(mng.create_file(&path, 10, 0, 0, false), Err(-libc::EINVAL));
        assert_eq!(
            mng.create_file(&path, 10, 4000, 0, false),
            Err(-libc::EINVAL)
        );
    }

    #[test]
    fn duplicate_open_path_is_eexist() {
        let dir = tempfile::tempdir().unwrap();
        let mng = FileManager::new();

        let token = create(&mng, dir.path(), "dup.bin", 10);
        let path = resolve_under_root(dir.path(), ".", "dup.bin").unwrap();
        assert_eq!(
            mng.create_file(&path, 10, 8192, 0, false),
            Err(-libc::EEXIST)
        );

        // Released tokens can be re-created.
        assert_eq!(mng.close_file(&token), 0);
        assert!(mng.create_file(&path, 10, 8192, 0, false).is_ok());
    }

    #[test]
    fn unknown_tokens_are_enoent() {
        let mng = FileManager::new();
        assert_eq!(mng.close_file("nope"), -libc::ENOENT);
        assert_eq!(mng.set_chain_targets("nope", Vec::new()), -libc::ENOENT);
        assert!(mng.get_file("nope").is_none());
        assert!(!mng.has_file("nope"));
    }

    #[test]
    fn chain_targets_update() {
        let dir = tempfile::tempdir().unwrap();
        let mng = FileManager::new();
        let token = create(&mng, dir.path(), "c.bin", 10);

        let next = ChainTarget {
            host: "10.0.0.2".into(),
            port: 5200,
            file_token: "peer".into(),
        };
        assert_eq!(mng.set_chain_targets(&token, vec![next.clone()]), 0);
        let (_, targets) = mng.get_file(&token).unwrap();
        assert_eq!(targets, vec![next]);
    }

    #[test]
    fn nested_directories_created() {
        let dir = tempfile::tempdir().unwrap();
        let mng = FileManager::new();
        let path = resolve_under_root(dir.path(), "a/b/c", "deep.bin").unwrap();
        let token = mng.create_file(&path, 1, 8192, 0, false).unwrap();
        assert!(dir.path().join("a/b/c/deep.bin").exists());
        mng.close_file(&token);
    }

    #[test]
    fn path_escapes_rejected() {
        let root = Path::new("/srv/fcopy");
        assert!(resolve_under_root(root, ".", "ok.bin").is_ok());
        assert!(resolve_under_root(root, "sub/dir", "ok.bin").is_ok());
        assert_eq!(
            resolve_under_root(root, "..", "evil.bin"),
            Err(-libc::EINVAL)
        );
        assert_eq!(
            resolve_under_root(root, "a/../../b", "evil.bin"),
            Err(-libc::EINVAL)
        );
        assert_eq!(
            resolve_under_root(root, "/etc", "passwd"),
            Err(-libc::EINVAL)
        );
        assert_eq!(
            resolve_under_root(root, ".", "nul\0name"),
            Err(-libc::EINVAL)
        );
        // Empty names resolve to the root itself and are refused.
        assert_eq!(resolve_under_root(root, ".", ""), Err(-libc::EINVAL));
    }
}
