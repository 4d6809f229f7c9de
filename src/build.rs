pub mod cancel;
pub mod context;
pub mod fingerprint;
pub mod incremental;
pub mod locale;
pub mod output;
pub mod pipeline;
pub mod stages;
pub mod writer;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use ulid::Ulid;

use crate::config::SiteConfig;
use crate::service::Services;
use crate::service::memory::{ContentSnapshot, MemoryStore};
use crate::theme::manifest::load_manifest;
use crate::theme::renderer::MiniJinjaRenderer;
use cancel::CancelToken;
use incremental::HashCache;
use pipeline::{BuildRequest, BuildResult, Builder, PlanEntry};
use stages::assets::FsAssetResolver;
use writer::FsWriter;

/// 构建运行参数
#[derive(Debug, Default)]
pub struct RunParams {
    pub clean: bool,
    pub force: bool,
    pub dry_run: bool,
    pub locales: Vec<String>,
    pub page_ids: Vec<Ulid>,
    /// 覆盖配置中的渲染线程数
    pub workers: Option<usize>,
}

/// 按项目目录装配协作方：内容快照、MiniJinja 渲染器、主题资源与输出目录
pub fn services(project_root: &Path, config: &SiteConfig) -> Result<Services> {
    let content_path = project_root.join(&config.build.content_file);
    let mut snapshot = ContentSnapshot::load(&content_path)
        .with_context(|| format!("加载内容快照失败：{}", content_path.display()))?;
    attach_manifests(project_root, &mut snapshot);
    tracing::debug!(
        "内容快照：{} 个语言，{} 条内容",
        snapshot.locales.len(),
        snapshot.contents.len()
    );

    Ok(Services::from_store(Arc::new(MemoryStore::new(snapshot)))
        .with_renderer(Arc::new(MiniJinjaRenderer::new(project_root)))
        .with_assets(Arc::new(FsAssetResolver::new(project_root)))
        .with_writer(Arc::new(FsWriter::new(
            project_root.join(&config.build.output_dir),
        ))))
}

/// 快照中未携带清单的主题，从 themes/<slug>/theme.toml 读取
fn attach_manifests(project_root: &Path, snapshot: &mut ContentSnapshot) {
    for theme in snapshot.themes.iter_mut().filter(|t| t.manifest.name.is_empty()) {
        if !project_root.join("themes").join(&theme.slug).join("theme.toml").is_file() {
            continue;
        }
        match load_manifest(project_root, &theme.slug) {
            Ok(manifest) => theme.manifest = manifest,
            Err(e) => tracing::warn!("主题 {} 的清单无效，按空清单处理：{e:#}", theme.slug),
        }
    }
}

pub fn run(
    project_root: &Path,
    config: &SiteConfig,
    params: RunParams,
    cancel: &CancelToken,
) -> Result<BuildResult> {
    let output_dir = project_root.join(&config.build.output_dir);
    let cache_dir = project_root.join(&config.build.cache_dir);

    if params.clean {
        FsWriter::new(&output_dir).clean()?;
        if cache_dir.exists() {
            std::fs::remove_dir_all(&cache_dir)?;
            tracing::info!("已清除缓存目录：{}", cache_dir.display());
        }
    }

    let mut cache = HashCache::load(&cache_dir);
    let config_changed = cache.config_changed(project_root)?;
    if config_changed {
        tracing::info!("站点配置已变更，全量重建");
    }
    // 输出目录被删除后缓存已不可信
    let force = params.force || params.clean || config_changed || !output_dir.exists();
    cache.update_config(project_root)?;

    let mut config = config.clone();
    if let Some(workers) = params.workers {
        config.build.workers = workers;
    }

    let services = services(project_root, &config)?;
    let builder = Builder::new(config, services).with_hash_cache(cache);
    let request = BuildRequest {
        locales: params.locales,
        page_ids: params.page_ids,
        dry_run: params.dry_run,
        force,
    };

    match builder.build(&request, cancel) {
        Ok(result) => Ok(result),
        Err(failure) => {
            let failure = *failure;
            tracing::error!(
                "已渲染 {} 个页面，{} 个错误",
                failure.result.pages_built,
                failure.result.errors.len()
            );
            Err(anyhow::Error::new(failure.error))
        }
    }
}

/// 列出将要构建的页面及其是否需要重新渲染
pub fn plan(project_root: &Path, config: &SiteConfig, locales: Vec<String>) -> Result<Vec<PlanEntry>> {
    let cache = HashCache::load(&project_root.join(&config.build.cache_dir));
    let services = services(project_root, config)?;
    let builder = Builder::new(config.clone(), services).with_hash_cache(cache);
    let request = BuildRequest {
        locales,
        ..Default::default()
    };
    Ok(builder.plan(&request, &CancelToken::new())?)
}
