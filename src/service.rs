//! 构建引擎依赖的外部协作方。
//!
//! 内容、语言、菜单、主题的增删改查以及模板渲染都不属于构建引擎，
//! 这里只定义构建所需的最小接口。`memory` 提供基于快照文件的实现。

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use ulid::Ulid;

use crate::build::context::TemplateContext;
use crate::build::writer::ArtifactWriter;
use crate::content::{
    Block, Content, ContentType, Locale, MenuNode, Template, Theme, WidgetPlacement,
};
use crate::error::ServiceError;
use crate::theme::manifest::{self, ThemeSelection};

pub type ServiceResult<T> = Result<T, ServiceError>;

pub trait ContentService: Send + Sync {
    fn get(&self, id: Ulid) -> ServiceResult<Content>;
    fn list_by_type(&self, content_type_id: Ulid) -> ServiceResult<Vec<Content>>;
}

pub trait ContentTypeService: Send + Sync {
    fn get_by_slug(&self, slug: &str) -> ServiceResult<ContentType>;
}

pub trait LocaleService: Send + Sync {
    fn get_by_code(&self, code: &str) -> ServiceResult<Locale>;
}

pub trait MenuService: Send + Sync {
    fn resolve_navigation(&self, menu_code: &str, locale_code: &str) -> ServiceResult<Vec<MenuNode>>;
}

pub trait ThemeService: Send + Sync {
    fn get_template(&self, id: Ulid) -> ServiceResult<Template>;
    fn get_theme(&self, id: Ulid) -> ServiceResult<Theme>;
}

pub trait ThemeSelector: Send + Sync {
    fn select(&self, theme: &Theme, variant: Option<&str>) -> ServiceResult<ThemeSelection>;
}

pub trait BlockService: Send + Sync {
    fn list_for_page(&self, page_id: Ulid, locale_id: Ulid) -> ServiceResult<Vec<Block>>;
}

pub trait WidgetService: Send + Sync {
    /// 返回 区域 → 挂件列表
    fn resolve_areas(
        &self,
        page_id: Ulid,
        locale_id: Ulid,
    ) -> ServiceResult<BTreeMap<String, Vec<WidgetPlacement>>>;
}

/// 模板渲染器：模板标识 + 上下文 → HTML
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, context: &TemplateContext) -> anyhow::Result<String>;

    /// 模板源文件的摘要，计入页面依赖指纹；模板不来自文件时返回 None
    fn source_digest(&self, _template: &str, _theme: Option<&ThemeSelection>) -> Option<String> {
        None
    }
}

/// 主题静态资源的定位与读取
pub trait AssetResolver: Send + Sync {
    /// 资源相对于输出目录 assets/ 的路径
    fn resolve_path(&self, theme: &ThemeSelection, asset: &str) -> ServiceResult<String>;
    fn open(&self, theme: &ThemeSelection, asset: &str) -> ServiceResult<Vec<u8>>;
}

/// 按主题清单选择变体
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestThemeSelector;

impl ThemeSelector for ManifestThemeSelector {
    fn select(&self, theme: &Theme, variant: Option<&str>) -> ServiceResult<ThemeSelection> {
        Ok(manifest::select_variant(theme, variant))
    }
}

/// 构建器使用的全部协作方，缺失的必需项在构建前报配置错误
#[derive(Clone, Default)]
pub struct Services {
    pub contents: Option<Arc<dyn ContentService>>,
    pub content_types: Option<Arc<dyn ContentTypeService>>,
    pub locales: Option<Arc<dyn LocaleService>>,
    pub menus: Option<Arc<dyn MenuService>>,
    pub themes: Option<Arc<dyn ThemeService>>,
    pub theme_selector: Option<Arc<dyn ThemeSelector>>,
    pub blocks: Option<Arc<dyn BlockService>>,
    pub widgets: Option<Arc<dyn WidgetService>>,
    pub renderer: Option<Arc<dyn TemplateRenderer>>,
    pub assets: Option<Arc<dyn AssetResolver>>,
    pub writer: Option<Arc<dyn ArtifactWriter>>,
}

impl Services {
    /// 用同一个内存仓库填充所有内容侧协作方
    pub fn from_store(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            contents: Some(store.clone()),
            content_types: Some(store.clone()),
            locales: Some(store.clone()),
            menus: Some(store.clone()),
            themes: Some(store.clone()),
            theme_selector: Some(Arc::new(ManifestThemeSelector)),
            blocks: Some(store.clone()),
            widgets: Some(store),
            renderer: None,
            assets: None,
            writer: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn ArtifactWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_assets(mut self, assets: Arc<dyn AssetResolver>) -> Self {
        self.assets = Some(assets);
        self
    }
}
