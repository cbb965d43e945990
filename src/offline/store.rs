//! 持久化存储契约
//!
//! 离线队列只通过 get/set/remove/clear 四个操作访问底层存储，
//! 具体存储由平台层注入。这里提供两个实现：
//!
//! - [`MemoryStore`]: 进程内存储，用于测试和不需要落盘的场景
//! - [`FileStore`]: 每个 key 一个 JSON 文件，先写临时文件再原子重命名
//!
//! ## 文件结构
//!
//! ```text
//! {dir}/
//! └── {key}.json
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// 存储文件扩展名
const STORE_EXTENSION: &str = "json";

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("存储 I/O 错误: {0}")]
    Io(#[from] io::Error),

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("非法的存储键: {0:?}")]
    InvalidKey(String),
}

/// 持久化存储契约
///
/// 视为尽力而为：调用方负责捕获并记录错误
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

// ============================================================================
// MemoryStore
// ============================================================================

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().clear();
        Ok(())
    }
}

// ============================================================================
// FileStore
// ============================================================================

/// 文件存储
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// 创建文件存储（目录不存在时自动创建）
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            debug!("已创建存储目录: {:?}", dir);
        }
        Ok(Self { dir })
    }

    /// 存储目录
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// key 是否可直接作为文件名
    ///
    /// 只允许 ASCII 字母数字和 `-` `_` `.`，且不能以 `.` 开头
    pub fn is_valid_key(key: &str) -> bool {
        !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    }

    /// 获取 key 对应的文件路径
    ///
    /// 不做字符替换，非法 key 直接拒绝，保证不同 key 不会落到同一个文件
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if !Self::is_valid_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.{}", key, STORE_EXTENSION)))
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;

        // 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(value.as_bytes())?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;

        debug!("已写入存储: {:?} ({} bytes)", path, value.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("已删除存储文件: {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            let is_store_file = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == STORE_EXTENSION)
                .unwrap_or(false);
            if path.is_file() && is_store_file {
                fs::remove_file(&path)?;
            }
        }
        debug!("已清空存储目录: {:?}", self.dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));

        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);

        store.clear().unwrap();
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().join("queue")).unwrap();

        assert_eq!(store.get("pending").unwrap(), None);

        store.set("pending", "[1,2,3]").unwrap();
        assert_eq!(store.get("pending").unwrap(), Some("[1,2,3]".to_string()));

        // 覆盖写入
        store.set("pending", "[]").unwrap();
        assert_eq!(store.get("pending").unwrap(), Some("[]".to_string()));

        // 不留临时文件
        assert!(!store
            .path_for("pending")
            .unwrap()
            .with_extension("json.tmp")
            .exists());
    }

    #[test]
    fn test_file_store_remove_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path()).unwrap();

        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        fs::write(temp_dir.path().join("unrelated.txt"), "keep").unwrap();

        store.remove("a").unwrap();
        // 删除不存在的 key 不报错
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);

        store.clear().unwrap();
        assert_eq!(store.get("b").unwrap(), None);
        assert!(temp_dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_file_store_rejects_unsafe_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path()).unwrap();

        for key in ["../evil/key", "a/b", "", ".hidden", "键"] {
            assert!(
                matches!(store.path_for(key), Err(StoreError::InvalidKey(_))),
                "key {:?} 应被拒绝",
                key
            );
            assert!(matches!(
                store.set(key, "x"),
                Err(StoreError::InvalidKey(_))
            ));
        }
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_store_distinct_keys_use_distinct_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path()).unwrap();

        store.set("a_b", "underscore").unwrap();
        assert!(store.set("a/b", "slash").is_err());
        store.set("a-b", "dash").unwrap();

        assert_eq!(store.get("a_b").unwrap(), Some("underscore".to_string()));
        assert_eq!(store.get("a-b").unwrap(), Some("dash".to_string()));
        assert_ne!(store.path_for("a_b").unwrap(), store.path_for("a-b").unwrap());
    }
}
