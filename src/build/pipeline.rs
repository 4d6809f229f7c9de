use chrono::Utc;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use ulid::Ulid;

use crate::build::cancel::CancelToken;
use crate::build::context::{BuildContext, BuildOptions, PageRenderRecord, SiteMeta};
use crate::build::fingerprint::{self, DependencyMetadata};
use crate::build::incremental::HashCache;
use crate::build::locale::resolve_locales;
use crate::build::stages::assemble::ContextAssembler;
use crate::build::stages::assets::persist_assets;
use crate::build::stages::finalize::finalize;
use crate::build::stages::load::PageLoader;
use crate::build::stages::render::{RenderDiagnostic, RenderPipeline, RenderedHtml};
use crate::build::writer::{ArtifactCategory, ArtifactSink, ArtifactWriter, NoopWriter, WriteRequest};
use crate::config::SiteConfig;
use crate::error::BuildError;
use crate::service::{
    ContentService, ContentTypeService, LocaleService, Services, TemplateRenderer,
};

/// 构建请求：语言与页面过滤均为空表示全部
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub locales: Vec<String>,
    pub page_ids: Vec<Ulid>,
    pub dry_run: bool,
    /// 忽略增量缓存，全部重新渲染
    pub force: bool,
}

/// 渲染并写入成功的页面
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_id: Ulid,
    pub locale: String,
    pub route: String,
    pub template: String,
    pub html: String,
    pub checksum: String,
    pub output_path: String,
    pub metadata: DependencyMetadata,
}

#[derive(Debug, Default)]
pub struct BuildResult {
    /// 渲染成功的页面数，预演模式同样计数
    pub pages_built: usize,
    pub assets_built: usize,
    /// 依赖未变而跳过的页面数
    pub cached: usize,
    pub locales: Vec<String>,
    pub duration: Duration,
    /// 按记录顺序排列，预演模式为空
    pub rendered_pages: Vec<RenderedPage>,
    pub diagnostics: Vec<RenderDiagnostic>,
    pub errors: Vec<BuildError>,
    pub dry_run: bool,
}

/// 构建失败时仍携带已收集到的结果
#[derive(Debug, Error)]
#[error("{error}")]
pub struct BuildFailure {
    pub result: BuildResult,
    #[source]
    pub error: BuildError,
}

/// `plan` 输出的一行
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub page_id: Ulid,
    pub locale: String,
    pub route: String,
    pub output_path: String,
    pub hash: String,
    pub changed: bool,
}

struct Required<'a> {
    contents: &'a dyn ContentService,
    content_types: &'a dyn ContentTypeService,
    locales: &'a dyn LocaleService,
    renderer: &'a dyn TemplateRenderer,
}

pub struct Builder {
    config: SiteConfig,
    services: Services,
    hash_cache: Option<Mutex<HashCache>>,
}

impl Builder {
    pub fn new(config: SiteConfig, services: Services) -> Self {
        Self {
            config,
            services,
            hash_cache: None,
        }
    }

    /// 启用增量构建缓存，非预演构建结束后保存
    pub fn with_hash_cache(mut self, cache: HashCache) -> Self {
        self.hash_cache = Some(Mutex::new(cache));
        self
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    fn required(&self) -> Result<Required<'_>, BuildError> {
        fn missing(what: &str) -> BuildError {
            BuildError::Config(format!("缺少{what}"))
        }
        Ok(Required {
            contents: self
                .services
                .contents
                .as_deref()
                .ok_or_else(|| missing("内容服务"))?,
            content_types: self
                .services
                .content_types
                .as_deref()
                .ok_or_else(|| missing("内容类型服务"))?,
            locales: self
                .services
                .locales
                .as_deref()
                .ok_or_else(|| missing("语言服务"))?,
            renderer: self
                .services
                .renderer
                .as_deref()
                .ok_or_else(|| missing("模板渲染器"))?,
        })
    }

    fn options(&self, request: &BuildRequest) -> BuildOptions {
        let mut options = BuildOptions::from_config(&self.config);
        options.dry_run = request.dry_run;
        options.force = request.force;
        options.page_ids = request.page_ids.clone();
        options
    }

    /// 解析语言、加载页面并组装构建上下文
    pub fn assemble(
        &self,
        request: &BuildRequest,
        cancel: &CancelToken,
    ) -> Result<BuildContext, BuildError> {
        let required = self.required()?;
        let build = &self.config.build;

        let locales = resolve_locales(
            &request.locales,
            &build.locales,
            &build.default_locale,
            required.locales,
        )?;
        tracing::info!("构建语言：{}", locales.codes().join(", "));

        let loader = PageLoader::new(
            required.contents,
            required.content_types,
            &build.page_content_type,
        );
        let pages = loader.load(&request.page_ids, &locales)?;
        tracing::info!("已加载 {} 个页面", pages.len());

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let records = ContextAssembler::new(
            &self.services,
            &build.menus,
            build.theme_variant.as_deref(),
            cancel,
        )
        .assemble(&pages, &locales)?;

        Ok(BuildContext {
            generated_at: Utc::now(),
            default_locale: locales.default.clone(),
            locales: locales.ordered,
            pages: records,
            menu_aliases: build.menus.clone(),
            options: self.options(request),
            site: SiteMeta::from_config(&self.config),
        })
    }

    /// 组装上下文并对比增量缓存，不渲染、不写入
    pub fn plan(
        &self,
        request: &BuildRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<PlanEntry>, BuildError> {
        let ctx = self.assemble(request, cancel)?;
        let cache = self.hash_cache.as_ref().map(|c| c.lock());
        Ok(ctx
            .pages
            .iter()
            .map(|record| PlanEntry {
                page_id: record.page.id,
                locale: record.locale.code.clone(),
                route: record.route().to_owned(),
                output_path: ctx.output_path(record),
                hash: record.metadata.hash.clone(),
                changed: cache
                    .as_ref()
                    .is_none_or(|c| c.has_changed(&record.cache_key(), &record.metadata.hash)),
            })
            .collect())
    }

    pub fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancelToken,
    ) -> Result<BuildResult, Box<BuildFailure>> {
        let started = Instant::now();
        let mut result = BuildResult {
            dry_run: request.dry_run,
            ..Default::default()
        };

        let fail = |mut result: BuildResult, error: BuildError| {
            result.duration = started.elapsed();
            tracing::error!("构建失败：{error}");
            Box::new(BuildFailure { result, error })
        };

        tracing::info!("开始构建...");
        let required = match self.required() {
            Ok(required) => required,
            Err(e) => return Err(fail(result, e)),
        };
        let ctx = match self.assemble(request, cancel) {
            Ok(ctx) => ctx,
            Err(e) => return Err(fail(result, e)),
        };
        result.locales = ctx.locales.iter().map(|l| l.code.clone()).collect();
        tracing::info!("构建上下文就绪：{} 个页面记录", ctx.pages.len());

        let (to_render, cached) = self.partition(&ctx);
        result.cached = cached.len();
        if !cached.is_empty() {
            tracing::info!("{} 个页面依赖未变，跳过渲染", cached.len());
        }

        let pipeline = RenderPipeline::new(&ctx, required.renderer, cancel);
        tracing::info!(
            "渲染 {} 个页面（{} 个工作线程）",
            to_render.len(),
            pipeline.workers_for(&to_render)
        );
        let report = pipeline.run(&to_render);
        result.pages_built = report.succeeded();
        result.diagnostics = report.diagnostics;
        result.errors = report.errors;
        if report.cancelled {
            return Err(fail(result, BuildError::Cancelled));
        }

        if request.dry_run {
            tracing::info!("预演模式，跳过写入");
        } else if let Err(e) = self.persist(&ctx, &report.rendered, &cached, &mut result, cancel) {
            return Err(fail(result, e));
        }

        result.duration = started.elapsed();
        tracing::info!(
            "构建完成，耗时 {:.2}s（渲染 {}，缓存 {}，资源 {}，错误 {}）",
            result.duration.as_secs_f64(),
            result.pages_built,
            result.cached,
            result.assets_built,
            result.errors.len(),
        );

        match BuildError::join(&result.errors) {
            Some(error) => Err(Box::new(BuildFailure { result, error })),
            None => Ok(result),
        }
    }

    /// 将记录分为需要渲染与依赖未变两组
    fn partition(&self, ctx: &BuildContext) -> (Vec<usize>, Vec<usize>) {
        let all = || (0..ctx.pages.len()).collect::<Vec<_>>();
        if !ctx.options.incremental || ctx.options.force {
            return (all(), Vec::new());
        }
        let Some(cache) = self.hash_cache.as_ref() else {
            return (all(), Vec::new());
        };

        let cache = cache.lock();
        ctx.pages
            .iter()
            .enumerate()
            .fold((Vec::new(), Vec::new()), |(mut render, mut skip), (index, record)| {
                if cache.has_changed(&record.cache_key(), &record.metadata.hash) {
                    render.push(index);
                } else {
                    skip.push(index);
                }
                (render, skip)
            })
    }

    /// 依次写入页面、主题资源、sitemap、robots 与 feed
    fn persist(
        &self,
        ctx: &BuildContext,
        rendered: &[RenderedHtml],
        cached: &[usize],
        result: &mut BuildResult,
        cancel: &CancelToken,
    ) -> Result<(), BuildError> {
        let writer: &dyn ArtifactWriter = self.services.writer.as_deref().unwrap_or(&NoopWriter);
        let sink = ArtifactSink::new(writer);
        let mut written: Vec<usize> = Vec::with_capacity(rendered.len());

        for page in rendered {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let record = &ctx.pages[page.index];
            match sink.write(page_request(record, page)) {
                Ok(()) => written.push(page.index),
                Err(e) => {
                    tracing::error!("{e}");
                    result.errors.push(e);
                }
            }
            result.rendered_pages.push(RenderedPage {
                page_id: record.page.id,
                locale: record.locale.code.clone(),
                route: record.route().to_owned(),
                template: template_name(record),
                html: page.html.clone(),
                checksum: page.checksum.clone(),
                output_path: page.output_path.clone(),
                metadata: record.metadata.clone(),
            });
        }
        tracing::info!("已写入 {} 个页面", written.len());

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        if ctx.options.assets {
            let (count, errors) = persist_assets(ctx, self.services.assets.as_deref(), &sink);
            result.assets_built = count;
            result.errors.extend(errors);
        }

        // 局部构建只含部分页面，不覆盖全站文档
        if ctx.options.page_ids.is_empty() {
            let mut published: Vec<usize> = written.iter().chain(cached).copied().collect();
            published.sort_unstable();
            let entries: Vec<&PageRenderRecord> = published.iter().map(|&i| &ctx.pages[i]).collect();
            result.errors.extend(finalize(ctx, &self.config, &entries, &sink));
        } else {
            tracing::debug!("局部构建，跳过 sitemap、robots 与 feed");
        }

        if let Some(cache) = self.hash_cache.as_ref() {
            let mut cache = cache.lock();
            for &index in &written {
                let record = &ctx.pages[index];
                cache.update(record.cache_key(), record.metadata.hash.clone());
            }
            if let Err(e) = cache.save() {
                tracing::warn!("保存哈希缓存失败：{e}");
            }
        }
        Ok(())
    }
}

fn template_name(record: &PageRenderRecord) -> String {
    record
        .template
        .as_ref()
        .and_then(|t| t.identifier())
        .unwrap_or_default()
        .to_owned()
}

fn page_request(record: &PageRenderRecord, page: &RenderedHtml) -> WriteRequest {
    WriteRequest::from_bytes(
        page.output_path.clone(),
        page.html.clone().into_bytes(),
        ArtifactCategory::Page,
        "text/html; charset=utf-8",
    )
    .with_checksum(page.checksum.clone())
    .with_metadata("page_id", record.page.id.to_string())
    .with_metadata("locale", record.locale.code.clone())
    .with_metadata("route", record.route())
    .with_metadata("template", template_name(record))
    .with_metadata("hash", record.metadata.hash.clone())
    .with_metadata(
        "last_modified",
        fingerprint::timestamp(&record.metadata.last_modified),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::stages::assets::FsAssetResolver;
    use crate::build::stages::render::RenderStatus;
    use crate::build::writer::FsWriter;
    use crate::error::{RenderError, ServiceError};
    use crate::content::MenuNode;
    use crate::service::{MenuService, ServiceResult};
    use crate::testutil::{Fixture, RecordingWriter, StubRenderer};
    use std::sync::Arc;

    fn en_only() -> BuildRequest {
        BuildRequest {
            locales: vec!["en".into()],
            ..Default::default()
        }
    }

    #[test]
    fn one_failure_does_not_stop_other_pages() {
        let fx = Fixture::new();
        let services = fx
            .services()
            .with_renderer(Arc::new(StubRenderer::failing_on("company")));
        let builder = Builder::new(fx.config(), services);

        let failure = builder.build(&en_only(), &CancelToken::new()).unwrap_err();
        let result = &failure.result;
        assert_eq!(result.pages_built, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.diagnostics.len(), 3);
        assert_eq!(result.rendered_pages.len(), 2);
        assert!(matches!(failure.error, BuildError::Joined { count: 1, .. }));
        assert!(matches!(
            result.errors[0],
            BuildError::Render {
                source: RenderError::Renderer { .. },
                ..
            }
        ));
        assert_eq!(
            result
                .diagnostics
                .iter()
                .filter(|d| d.status == RenderStatus::Rendered)
                .count(),
            2
        );
    }

    #[test]
    fn full_build_writes_expected_layout() {
        let fx = Fixture::new();
        let builder = Builder::new(fx.config(), fx.services());
        let result = builder.build(&BuildRequest::default(), &CancelToken::new()).unwrap();

        assert_eq!(result.pages_built, 5);
        assert_eq!(result.locales, ["en", "es", "fr"]);
        let routes: Vec<&str> = result.rendered_pages.iter().map(|p| p.output_path.as_str()).collect();
        assert_eq!(
            routes,
            [
                "index.html",
                "es/index.html",
                "company/index.html",
                "es/empresa/index.html",
                "company/team/index.html",
            ]
        );
        assert_eq!(fx.writer.paths_in(ArtifactCategory::Page), routes);
        assert_eq!(fx.writer.paths_in(ArtifactCategory::Sitemap), ["sitemap.xml"]);
        assert_eq!(fx.writer.paths_in(ArtifactCategory::Robots), ["robots.txt"]);

        let home = fx.writer.request("index.html");
        assert_eq!(home.checksum, result.rendered_pages[0].checksum);
        assert_eq!(home.content_type, "text/html; charset=utf-8");
        assert_eq!(home.metadata["locale"], "en");
        assert_eq!(home.metadata["hash"], result.rendered_pages[0].metadata.hash);
    }

    #[test]
    fn dry_run_renders_without_writing() {
        let fx = Fixture::new();
        let builder = Builder::new(fx.config(), fx.services());
        let request = BuildRequest {
            dry_run: true,
            ..Default::default()
        };
        let result = builder.build(&request, &CancelToken::new()).unwrap();
        assert!(result.dry_run);
        assert_eq!(result.pages_built, 5);
        assert!(result.rendered_pages.is_empty());
        assert!(fx.writer.paths().is_empty());
        assert!(fx.writer.ensured_dirs().is_empty());
    }

    #[test]
    fn worker_count_does_not_change_artifacts() {
        let fx = Fixture::new();
        let outputs = |workers: usize| {
            let mut config = fx.config();
            config.build.workers = workers;
            let builder = Builder::new(config, fx.services());
            let result = builder.build(&BuildRequest::default(), &CancelToken::new()).unwrap();
            result
                .rendered_pages
                .into_iter()
                .map(|p| (p.route, p.locale, p.checksum, p.metadata.hash))
                .collect::<Vec<_>>()
        };
        assert_eq!(outputs(1), outputs(4));
    }

    #[test]
    fn hashes_are_stable_across_builds() {
        let fx = Fixture::new();
        let builder = Builder::new(fx.config(), fx.services());
        let first = builder.plan(&BuildRequest::default(), &CancelToken::new()).unwrap();
        let second = builder.plan(&BuildRequest::default(), &CancelToken::new()).unwrap();
        let hashes = |plan: &[PlanEntry]| plan.iter().map(|e| e.hash.clone()).collect::<Vec<_>>();
        assert_eq!(hashes(&first), hashes(&second));
        assert!(first.iter().all(|e| e.changed));
    }

    #[test]
    fn unchanged_pages_are_skipped_on_rebuild() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();

        let builder = Builder::new(fx.config(), fx.services()).with_hash_cache(HashCache::load(dir.path()));
        let first = builder.build(&BuildRequest::default(), &CancelToken::new()).unwrap();
        assert_eq!(first.pages_built, 5);
        assert_eq!(first.cached, 0);

        let writer = Arc::new(RecordingWriter::default());
        let services = fx.services().with_writer(writer.clone());
        let builder = Builder::new(fx.config(), services).with_hash_cache(HashCache::load(dir.path()));
        let second = builder.build(&BuildRequest::default(), &CancelToken::new()).unwrap();
        assert_eq!(second.pages_built, 0);
        assert_eq!(second.cached, 5);
        assert!(writer.paths_in(ArtifactCategory::Page).is_empty());
        assert_eq!(writer.body("sitemap.xml").matches("<url>").count(), 5);

        let forced = BuildRequest {
            force: true,
            ..Default::default()
        };
        let third = builder.build(&forced, &CancelToken::new()).unwrap();
        assert_eq!(third.pages_built, 5);
    }

    /// 用修改后的快照在同一缓存目录上重新构建
    fn rebuild(
        fx: &Fixture,
        snapshot: crate::service::memory::ContentSnapshot,
        cache_dir: &std::path::Path,
    ) -> (BuildResult, Arc<RecordingWriter>) {
        let writer = Arc::new(RecordingWriter::default());
        let store = Arc::new(crate::service::memory::MemoryStore::new(snapshot));
        let services = Services::from_store(store)
            .with_renderer(Arc::new(StubRenderer::default()))
            .with_writer(writer.clone());
        let result = Builder::new(fx.config(), services)
            .with_hash_cache(HashCache::load(cache_dir))
            .build(&BuildRequest::default(), &CancelToken::new())
            .unwrap();
        (result, writer)
    }

    #[test]
    fn changed_translation_rerenders_only_its_record() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = rebuild(&fx, fx.snapshot.clone(), dir.path());
        assert_eq!(first.pages_built, 5);

        let mut snapshot = fx.snapshot.clone();
        let home = snapshot.contents.iter_mut().find(|c| c.id == fx.home_id).unwrap();
        home.translations[0].fields["body"] = serde_json::json!("Welcome back");

        let (second, writer) = rebuild(&fx, snapshot, dir.path());
        assert_eq!(second.pages_built, 1);
        assert_eq!(second.cached, 4);
        assert_eq!(writer.paths_in(ArtifactCategory::Page), ["index.html"]);
        assert_eq!(writer.body("sitemap.xml").matches("<url>").count(), 5);
    }

    #[test]
    fn changed_sibling_route_rerenders_every_locale_of_the_page() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        rebuild(&fx, fx.snapshot.clone(), dir.path());

        let mut snapshot = fx.snapshot.clone();
        let company = snapshot.contents.iter_mut().find(|c| c.id == fx.company_id).unwrap();
        company.translations[1].fields["path"] = serde_json::json!("/compania");

        let (second, writer) = rebuild(&fx, snapshot, dir.path());
        assert_eq!(second.pages_built, 2);
        assert_eq!(second.cached, 3);
        assert_eq!(
            writer.paths_in(ArtifactCategory::Page),
            ["company/index.html", "es/compania/index.html"]
        );
    }

    #[test]
    fn changed_metadata_rerenders_the_page() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        rebuild(&fx, fx.snapshot.clone(), dir.path());

        let mut snapshot = fx.snapshot.clone();
        let home = snapshot.contents.iter_mut().find(|c| c.id == fx.home_id).unwrap();
        home.metadata.insert("layout".into(), serde_json::json!("wide"));

        let (second, _) = rebuild(&fx, snapshot, dir.path());
        assert_eq!(second.pages_built, 2);
        assert_eq!(second.cached, 3);
    }

    #[test]
    fn partial_build_renders_requested_page_only() {
        let fx = Fixture::new();
        let builder = Builder::new(fx.config(), fx.services());
        let request = BuildRequest {
            page_ids: vec![fx.company_id],
            ..Default::default()
        };
        let result = builder.build(&request, &CancelToken::new()).unwrap();
        assert_eq!(result.pages_built, 2);
        assert!(fx.writer.paths_in(ArtifactCategory::Sitemap).is_empty());
    }

    #[test]
    fn missing_renderer_is_a_config_error() {
        let fx = Fixture::new();
        let mut services = fx.services();
        services.renderer = None;
        let failure = Builder::new(fx.config(), services)
            .build(&BuildRequest::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(failure.error, BuildError::Config(_)));
        assert!(failure.result.diagnostics.is_empty());
    }

    #[test]
    fn unknown_locale_aborts() {
        let fx = Fixture::new();
        let request = BuildRequest {
            locales: vec!["de".into()],
            ..Default::default()
        };
        let failure = Builder::new(fx.config(), fx.services())
            .build(&request, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(failure.error, BuildError::UnknownLocale(ref code) if code == "de"));
    }

    struct BrokenMenus;

    impl MenuService for BrokenMenus {
        fn resolve_navigation(&self, _menu_code: &str, _locale_code: &str) -> ServiceResult<Vec<MenuNode>> {
            Err(ServiceError::Other(anyhow::anyhow!("connection reset")))
        }
    }

    #[test]
    fn collaborator_failure_aborts_the_build() {
        let fx = Fixture::new();
        let mut services = fx.services();
        services.menus = Some(Arc::new(BrokenMenus));
        let failure = Builder::new(fx.config(), services)
            .build(&BuildRequest::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(failure.error, BuildError::Service { .. }));
        assert!(fx.writer.paths().is_empty());
    }

    #[test]
    fn cancelled_build_returns_partial_result() {
        let fx = Fixture::new();
        let cancel = CancelToken::new();
        let renderer = StubRenderer::default().cancel_after("company", cancel.clone());
        let mut config = fx.config();
        config.build.workers = 1;
        let services = fx.services().with_renderer(Arc::new(renderer));

        let failure = Builder::new(config, services)
            .build(&BuildRequest::default(), &cancel)
            .unwrap_err();
        assert!(failure.error.is_cancelled());
        assert_eq!(failure.result.pages_built, 2);
        assert_eq!(failure.result.diagnostics.len(), 5);
        assert!(fx.writer.paths().is_empty());
    }

    #[test]
    fn writes_to_disk_with_theme_assets() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        fx.write_theme_assets(dir.path());
        let output = dir.path().join("public");

        let services = fx
            .services()
            .with_writer(Arc::new(FsWriter::new(&output)))
            .with_assets(Arc::new(FsAssetResolver::new(dir.path())));
        let result = Builder::new(fx.config(), services)
            .build(&BuildRequest::default(), &CancelToken::new())
            .unwrap();

        assert_eq!(result.assets_built, 2);
        for path in [
            "index.html",
            "es/empresa/index.html",
            "company/team/index.html",
            "assets/aurora/css/main.css",
            "sitemap.xml",
            "robots.txt",
            "feed.xml",
            "es/feed.xml",
        ] {
            assert!(output.join(path).is_file(), "missing {path}");
        }
        let html = std::fs::read_to_string(output.join("es/empresa/index.html")).unwrap();
        assert_eq!(html, result.rendered_pages[3].html);
    }
}
