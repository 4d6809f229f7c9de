use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::build::fingerprint::sha256_hex;
use crate::config::CONFIG_FILE;

const CACHE_FILE: &str = "hashes.json";
const CONFIG_KEY: &str = "config";

/// 依赖哈希缓存：记录每个（页面，语言）上次成功构建时的依赖哈希，支持增量构建
#[derive(Debug, Default)]
pub struct HashCache {
    hashes: BTreeMap<String, String>,
    cache_path: PathBuf,
}

impl HashCache {
    /// 缓存文件不存在时为空表，损坏时记录警告后同样从空表开始
    pub fn load(cache_dir: &Path) -> Self {
        let cache_path = cache_dir.join(CACHE_FILE);
        let hashes: BTreeMap<String, String> = match std::fs::read_to_string(&cache_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("哈希缓存已损坏，将全量重建：{e}");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        tracing::debug!("已加载 {} 条哈希缓存", hashes.len());
        Self { hashes, cache_path }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.cache_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("创建缓存目录失败：{}", dir.display()))?;
        }
        let body = serde_json::to_vec_pretty(&self.hashes)?;
        std::fs::write(&self.cache_path, body)
            .with_context(|| format!("写入哈希缓存失败：{}", self.cache_path.display()))
    }

    /// 文件内容的 SHA-256（十六进制）
    pub fn file_hash(path: &Path) -> Result<String> {
        let data = std::fs::read(path).with_context(|| format!("读取 {} 失败", path.display()))?;
        Ok(sha256_hex(&data))
    }

    /// 哈希不同或不在缓存中即视为变更
    pub fn has_changed(&self, key: &str, current_hash: &str) -> bool {
        self.hashes
            .get(key)
            .is_none_or(|cached| cached != current_hash)
    }

    pub fn update(&mut self, key: String, hash: String) {
        self.hashes.insert(key, hash);
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// 站点配置文件自上次记录后是否变更，文件不存在视为未变
    pub fn config_changed(&self, project_root: &Path) -> Result<bool> {
        Ok(config_hash(project_root)?.is_some_and(|hash| self.has_changed(CONFIG_KEY, &hash)))
    }

    pub fn update_config(&mut self, project_root: &Path) -> Result<()> {
        if let Some(hash) = config_hash(project_root)? {
            self.update(CONFIG_KEY.to_owned(), hash);
        }
        Ok(())
    }
}

fn config_hash(project_root: &Path) -> Result<Option<String>> {
    let path = project_root.join(CONFIG_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    HashCache::file_hash(&path).map(Some)
}
