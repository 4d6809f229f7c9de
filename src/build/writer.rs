//! 构建产物写入。
//!
//! 构建引擎只通过 [`ArtifactWriter`] 持久化产物，文件系统之外的后端（对象存储等）
//! 实现同一接口即可。所有路径均为相对输出根目录的 `/` 分隔路径。

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::build::fingerprint::sha256_hex;
use crate::error::{BuildError, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactCategory {
    Page,
    Asset,
    Sitemap,
    Robots,
    Feed,
}

impl ArtifactCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Asset => "asset",
            Self::Sitemap => "sitemap",
            Self::Robots => "robots",
            Self::Feed => "feed",
        }
    }
}

/// 一次写入请求，内容以流的形式提供
pub struct WriteRequest {
    pub path: String,
    pub reader: Box<dyn Read + Send>,
    pub size: u64,
    pub category: ArtifactCategory,
    pub content_type: String,
    pub checksum: String,
    pub metadata: BTreeMap<String, String>,
}

impl WriteRequest {
    pub fn from_bytes(
        path: impl Into<String>,
        data: Vec<u8>,
        category: ArtifactCategory,
        content_type: &str,
    ) -> Self {
        Self {
            path: path.into(),
            size: data.len() as u64,
            checksum: sha256_hex(&data),
            reader: Box::new(std::io::Cursor::new(data)),
            category,
            content_type: content_type.to_owned(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_checksum(mut self, checksum: String) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }
}

impl std::fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRequest")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("category", &self.category)
            .field("content_type", &self.content_type)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

pub trait ArtifactWriter: Send + Sync {
    fn ensure_dir(&self, dir: &str) -> Result<(), StorageError>;
    fn write_file(&self, request: WriteRequest) -> Result<(), StorageError>;
}

/// 丢弃全部写入
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWriter;

impl ArtifactWriter for NoopWriter {
    fn ensure_dir(&self, _dir: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn write_file(&self, _request: WriteRequest) -> Result<(), StorageError> {
        Ok(())
    }
}

/// 写入本地输出目录
#[derive(Debug, Clone)]
pub struct FsWriter {
    root: PathBuf,
}

impl FsWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 删除整个输出目录
    pub fn clean(&self) -> Result<(), StorageError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
            tracing::info!("已清除输出目录：{}", self.root.display());
        }
        Ok(())
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StorageError::OutsideRoot(relative.to_owned()));
        }
        Ok(self.root.join(rel))
    }
}

impl ArtifactWriter for FsWriter {
    fn ensure_dir(&self, dir: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(self.resolve(dir)?)?;
        Ok(())
    }

    fn write_file(&self, mut request: WriteRequest) -> Result<(), StorageError> {
        let path = self.resolve(&request.path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&path)?;
        std::io::copy(&mut request.reader, &mut file)?;
        tracing::debug!("已写入：{}", path.display());
        Ok(())
    }
}

/// 构建期间的写入入口：每个目录只确保一次，错误带上路径
pub struct ArtifactSink<'a> {
    writer: &'a dyn ArtifactWriter,
    ensured: Mutex<HashSet<String>>,
}

impl<'a> ArtifactSink<'a> {
    pub fn new(writer: &'a dyn ArtifactWriter) -> Self {
        Self {
            writer,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    pub fn write(&self, request: WriteRequest) -> Result<(), BuildError> {
        let path = request.path.clone();
        let to_error = |source| BuildError::Write {
            path: path.clone(),
            source,
        };

        if let Some((dir, _)) = path.rsplit_once('/')
            && !dir.is_empty()
        {
            let mut ensured = self.ensured.lock();
            if !ensured.contains(dir) {
                self.writer.ensure_dir(dir).map_err(to_error)?;
                ensured.insert(dir.to_owned());
            }
        }

        self.writer.write_file(request).map_err(to_error)
    }
}
