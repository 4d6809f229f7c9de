use std::collections::HashSet;
use std::path::{Path, PathBuf};
use ulid::Ulid;

use crate::build::context::BuildContext;
use crate::build::output;
use crate::build::writer::{ArtifactCategory, ArtifactSink, WriteRequest};
use crate::error::{BuildError, ServiceError};
use crate::service::{AssetResolver, ServiceResult};
use crate::theme::manifest::ThemeSelection;

/// 输出目录下主题资源的根
pub const ASSETS_DIR: &str = "assets";

/// 从 themes/<slug>/assets/ 读取主题资源
#[derive(Debug, Clone)]
pub struct FsAssetResolver {
    themes_dir: PathBuf,
}

impl FsAssetResolver {
    pub fn new(project_root: &Path) -> Self {
        Self {
            themes_dir: project_root.join("themes"),
        }
    }

    fn source_path(&self, theme: &ThemeSelection, asset: &str) -> PathBuf {
        let relative = output::join_relative("", asset);
        self.themes_dir
            .join(&theme.theme_slug)
            .join(ASSETS_DIR)
            .join(relative)
    }
}

impl AssetResolver for FsAssetResolver {
    fn resolve_path(&self, theme: &ThemeSelection, asset: &str) -> ServiceResult<String> {
        let source = self.source_path(theme, asset);
        if !source.is_file() {
            return Err(ServiceError::not_found(source.display().to_string()));
        }
        Ok(output::join_relative(&theme.asset_base, asset))
    }

    fn open(&self, theme: &ThemeSelection, asset: &str) -> ServiceResult<Vec<u8>> {
        let source = self.source_path(theme, asset);
        std::fs::read(&source).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ServiceError::not_found(source.display().to_string()),
            _ => ServiceError::Other(anyhow::Error::new(e).context(format!(
                "读取主题资源失败：{}",
                source.display()
            ))),
        })
    }
}

/// 写入本次构建涉及的全部主题资源，按（主题，输出路径）去重。
/// 返回写入数量与逐个资源的错误，单个资源失败不影响其它资源。
pub fn persist_assets(
    ctx: &BuildContext,
    resolver: Option<&dyn AssetResolver>,
    sink: &ArtifactSink<'_>,
) -> (usize, Vec<BuildError>) {
    let Some(resolver) = resolver else {
        tracing::debug!("未配置资源读取器，跳过主题资源");
        return (0, Vec::new());
    };

    let mut seen: HashSet<(Ulid, &str)> = HashSet::new();
    let mut written = 0;
    let mut errors = Vec::new();

    for record in &ctx.pages {
        let Some(selection) = record.selection.as_deref() else {
            continue;
        };
        for asset in &record.assets {
            if !seen.insert((asset.theme_id, asset.path.as_str())) {
                continue;
            }

            let data = match resolver.open(selection, &asset.source) {
                Ok(data) => data,
                Err(e) if e.is_absence() => {
                    tracing::warn!("主题资源不存在，已跳过：{}/{}", asset.theme_slug, asset.source);
                    continue;
                }
                Err(source) => {
                    errors.push(BuildError::Asset {
                        theme: asset.theme_slug.clone(),
                        asset: asset.source.clone(),
                        source,
                    });
                    continue;
                }
            };

            let path = output::join_relative(ASSETS_DIR, &asset.path);
            let request = WriteRequest::from_bytes(
                path,
                data,
                ArtifactCategory::Asset,
                content_type_for(&asset.path),
            )
            .with_metadata("theme", asset.theme_slug.clone())
            .with_metadata("source", asset.source.clone());

            match sink.write(request) {
                Ok(()) => written += 1,
                Err(e) => errors.push(e),
            }
        }
    }

    tracing::info!("已写入 {written} 个主题资源");
    (written, errors)
}

pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("html") => "text/html; charset=utf-8",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
