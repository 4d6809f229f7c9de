use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use ulid::Ulid;

use crate::build::fingerprint::{self, DependencyMetadata};
use crate::build::locale::LocaleSpec;
use crate::build::output;
use crate::config::SiteConfig;
use crate::content::{
    Block, Content, ContentTranslation, MenuNode, Page, PageTranslation, Template, Theme,
    WidgetPlacement,
};
use crate::theme::manifest::ThemeSelection;

/// 单次构建的选项：站点配置与请求参数合并后的结果
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub dry_run: bool,
    pub force: bool,
    /// 0 表示使用可用并行度
    pub workers: usize,
    pub page_ids: Vec<Ulid>,
    pub theme_variant: Option<String>,
    pub sitemap: bool,
    pub robots: bool,
    pub assets: bool,
    pub feeds: bool,
    pub incremental: bool,
}

impl BuildOptions {
    pub fn from_config(config: &SiteConfig) -> Self {
        Self {
            dry_run: false,
            force: false,
            workers: config.build.workers,
            page_ids: Vec::new(),
            theme_variant: config.build.theme_variant.clone(),
            sitemap: config.features.sitemap,
            robots: config.features.robots,
            assets: config.features.assets,
            feeds: config.features.feeds,
            incremental: config.features.incremental,
        }
    }
}

/// 模板可见的站点信息
#[derive(Debug, Clone, Serialize)]
pub struct SiteMeta {
    pub title: String,
    pub description: String,
    pub url: String,
    pub author: String,
}

impl SiteMeta {
    pub fn from_config(config: &SiteConfig) -> Self {
        Self {
            title: config.site.title.clone(),
            description: config.site.description.clone(),
            url: config.site.url.trim_end_matches('/').to_owned(),
            author: config.site.author.clone(),
        }
    }
}

/// 已解析到输出目录的主题资源
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub theme_id: Ulid,
    pub theme_slug: String,
    /// 主题内的资源路径
    pub source: String,
    /// 相对于 assets/ 的输出路径
    pub path: String,
    pub url: String,
}

/// 一个（页面，语言）渲染单元，组装完成后只读
#[derive(Debug, Clone)]
pub struct PageRenderRecord {
    pub page: Arc<Page>,
    pub locale: LocaleSpec,
    pub translation: PageTranslation,
    pub content: Arc<Content>,
    pub content_translation: ContentTranslation,
    pub blocks: Vec<Block>,
    pub widgets: BTreeMap<String, Vec<WidgetPlacement>>,
    pub menus: BTreeMap<String, Vec<MenuNode>>,
    pub template: Option<Arc<Template>>,
    pub theme: Option<Arc<Theme>>,
    pub selection: Option<Arc<ThemeSelection>>,
    pub assets: Vec<ResolvedAsset>,
    /// 其它语言代码 → 同一页面的站内 URL
    pub alternates: BTreeMap<String, String>,
    pub metadata: DependencyMetadata,
}

impl PageRenderRecord {
    pub fn route(&self) -> &str {
        &self.translation.path
    }

    /// 增量缓存键
    pub fn cache_key(&self) -> String {
        format!("page:{}:{}", self.page.id, self.locale.code)
    }
}

/// 一次构建的完整只读快照，渲染期间跨线程共享
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub generated_at: DateTime<Utc>,
    pub default_locale: LocaleSpec,
    pub locales: Vec<LocaleSpec>,
    pub pages: Vec<PageRenderRecord>,
    pub menu_aliases: BTreeMap<String, String>,
    pub options: BuildOptions,
    pub site: SiteMeta,
}

impl BuildContext {
    pub fn output_path(&self, record: &PageRenderRecord) -> String {
        output::map_path(record.route(), &record.locale.code, &self.default_locale.code)
    }

    pub fn public_url(&self, record: &PageRenderRecord) -> String {
        output::public_url(record.route(), &record.locale.code, &self.default_locale.code)
    }
}

/// 传给模板渲染器的上下文
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext {
    pub site: SiteMeta,
    pub page: PageContext,
    pub build: BuildMeta,
    pub helpers: LocaleHelpers,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageContext {
    pub id: String,
    pub slug: String,
    pub locale: String,
    pub route: String,
    pub url: String,
    pub title: String,
    pub summary: Option<String>,
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,
    pub content: Value,
    pub metadata: Map<String, Value>,
    pub blocks: Vec<Block>,
    pub widgets: BTreeMap<String, Vec<WidgetPlacement>>,
    pub menus: BTreeMap<String, Vec<MenuNode>>,
    pub template: Option<String>,
    pub theme: Option<ThemeSelection>,
    pub assets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildMeta {
    pub generated_at: String,
    pub dry_run: bool,
    pub hash: String,
    pub last_modified: String,
}

/// 语言相关的模板辅助数据，渲染器据此提供 url_for / asset_url / alternate 等函数
#[derive(Debug, Clone, Serialize)]
pub struct LocaleHelpers {
    pub locale: String,
    pub default_locale: String,
    pub locales: Vec<String>,
    /// 当前语言的 URL 前缀，如 `/es`，默认语言为空串
    pub base_path: String,
    pub asset_base: String,
    pub alternates: BTreeMap<String, String>,
}

impl LocaleHelpers {
    /// 将站内路由转换为当前语言下的 URL
    pub fn url_for(&self, route: &str) -> String {
        output::public_url(route, &self.locale, &self.default_locale)
    }

    pub fn asset_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.asset_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl TemplateContext {
    pub fn compose(ctx: &BuildContext, record: &PageRenderRecord) -> Self {
        let template_id = record
            .template
            .as_ref()
            .and_then(|t| t.identifier().map(str::to_owned));
        let asset_base = match &record.selection {
            Some(sel) => format!("/assets/{}", sel.asset_base),
            None => "/assets".to_owned(),
        };
        let prefix = output::locale_prefix(&record.locale.code, &ctx.default_locale.code);

        Self {
            site: ctx.site.clone(),
            page: PageContext {
                id: record.page.id.to_string(),
                slug: record.page.slug.clone(),
                locale: record.locale.code.clone(),
                route: record.translation.path.clone(),
                url: ctx.public_url(record),
                title: record.translation.title.clone(),
                summary: record
                    .translation
                    .summary
                    .clone()
                    .or_else(|| record.content_translation.summary.clone()),
                seo_title: record.translation.seo_title.clone(),
                seo_description: record.translation.seo_description.clone(),
                content: record.content_translation.fields.clone(),
                metadata: record.page.metadata.clone(),
                blocks: record.blocks.clone(),
                widgets: record.widgets.clone(),
                menus: record.menus.clone(),
                template: template_id,
                theme: record.selection.as_deref().cloned(),
                assets: record.assets.iter().map(|a| a.url.clone()).collect(),
            },
            build: BuildMeta {
                generated_at: fingerprint::timestamp(&ctx.generated_at),
                dry_run: ctx.options.dry_run,
                hash: record.metadata.hash.clone(),
                last_modified: fingerprint::timestamp(&record.metadata.last_modified),
            },
            helpers: LocaleHelpers {
                locale: record.locale.code.clone(),
                default_locale: ctx.default_locale.code.clone(),
                locales: ctx.locales.iter().map(|l| l.code.clone()).collect(),
                base_path: if prefix.is_empty() {
                    String::new()
                } else {
                    format!("/{prefix}")
                },
                asset_base,
                alternates: record.alternates.clone(),
            },
        }
    }
}
