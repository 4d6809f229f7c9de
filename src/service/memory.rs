use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use ulid::Ulid;

use super::{
    BlockService, ContentService, ContentTypeService, LocaleService, MenuService,
    ServiceResult, ThemeService, WidgetService,
};
use crate::content::{
    Block, Content, ContentType, Locale, MenuNode, Template, Theme, WidgetPlacement,
};
use crate::error::ServiceError;

/// 内容图快照（content.json）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentSnapshot {
    #[serde(default)]
    pub locales: Vec<Locale>,
    #[serde(default)]
    pub content_types: Vec<ContentType>,
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub themes: Vec<Theme>,
    /// 菜单编码 → 语言代码 → 导航树
    #[serde(default)]
    pub menus: BTreeMap<String, BTreeMap<String, Vec<MenuNode>>>,
    /// 页面 ID → 区块
    #[serde(default)]
    pub blocks: BTreeMap<Ulid, Vec<Block>>,
    /// 页面 ID → 挂件
    #[serde(default)]
    pub widgets: BTreeMap<Ulid, Vec<WidgetPlacement>>,
}

impl ContentSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取内容快照失败：{}", path.display()))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("解析内容快照失败：{}", path.display()))?;
        Ok(snapshot)
    }
}

/// 基于快照的只读内容仓库，实现全部内容侧协作接口
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: ContentSnapshot,
    themes_disabled: AtomicBool,
    menu_resolutions: AtomicUsize,
}

impl MemoryStore {
    pub fn new(snapshot: ContentSnapshot) -> Self {
        Self {
            snapshot,
            themes_disabled: AtomicBool::new(false),
            menu_resolutions: AtomicUsize::new(0),
        }
    }

    /// 关闭主题功能后，模板与主题查询返回 FeatureDisabled
    pub fn set_themes_disabled(&self, disabled: bool) {
        self.themes_disabled.store(disabled, Ordering::SeqCst);
    }

    /// 累计的菜单解析次数
    pub fn menu_resolutions(&self) -> usize {
        self.menu_resolutions.load(Ordering::SeqCst)
    }

    fn check_themes_enabled(&self) -> ServiceResult<()> {
        if self.themes_disabled.load(Ordering::SeqCst) {
            return Err(ServiceError::FeatureDisabled("themes".into()));
        }
        Ok(())
    }
}

impl ContentService for MemoryStore {
    fn get(&self, id: Ulid) -> ServiceResult<Content> {
        self.snapshot
            .contents
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("content {id}")))
    }

    fn list_by_type(&self, content_type_id: Ulid) -> ServiceResult<Vec<Content>> {
        Ok(self
            .snapshot
            .contents
            .iter()
            .filter(|c| c.content_type_id == content_type_id)
            .cloned()
            .collect())
    }
}

impl ContentTypeService for MemoryStore {
    fn get_by_slug(&self, slug: &str) -> ServiceResult<ContentType> {
        self.snapshot
            .content_types
            .iter()
            .find(|t| t.slug == slug)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("content type {slug}")))
    }
}

impl LocaleService for MemoryStore {
    fn get_by_code(&self, code: &str) -> ServiceResult<Locale> {
        self.snapshot
            .locales
            .iter()
            .find(|l| l.code.eq_ignore_ascii_case(code))
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("locale {code}")))
    }
}

impl MenuService for MemoryStore {
    fn resolve_navigation(&self, menu_code: &str, locale_code: &str) -> ServiceResult<Vec<MenuNode>> {
        self.menu_resolutions.fetch_add(1, Ordering::SeqCst);
        self.snapshot
            .menus
            .get(menu_code)
            .and_then(|by_locale| {
                by_locale
                    .iter()
                    .find(|(code, _)| code.eq_ignore_ascii_case(locale_code))
                    .map(|(_, tree)| tree.clone())
            })
            .ok_or_else(|| ServiceError::not_found(format!("menu {menu_code} ({locale_code})")))
    }
}

impl ThemeService for MemoryStore {
    fn get_template(&self, id: Ulid) -> ServiceResult<Template> {
        self.check_themes_enabled()?;
        self.snapshot
            .templates
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("template {id}")))
    }

    fn get_theme(&self, id: Ulid) -> ServiceResult<Theme> {
        self.check_themes_enabled()?;
        self.snapshot
            .themes
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("theme {id}")))
    }
}

impl BlockService for MemoryStore {
    fn list_for_page(&self, page_id: Ulid, locale_id: Ulid) -> ServiceResult<Vec<Block>> {
        let mut blocks: Vec<Block> = self
            .snapshot
            .blocks
            .get(&page_id)
            .into_iter()
            .flatten()
            .filter(|b| b.locale_id.is_none_or(|id| id == locale_id))
            .cloned()
            .collect();
        blocks.sort_by_key(|b| b.position);
        Ok(blocks)
    }
}

impl WidgetService for MemoryStore {
    fn resolve_areas(
        &self,
        page_id: Ulid,
        _locale_id: Ulid,
    ) -> ServiceResult<BTreeMap<String, Vec<WidgetPlacement>>> {
        let mut areas: BTreeMap<String, Vec<WidgetPlacement>> = BTreeMap::new();
        for widget in self.snapshot.widgets.get(&page_id).into_iter().flatten() {
            areas
                .entry(widget.area.clone())
                .or_default()
                .push(widget.clone());
        }
        for placements in areas.values_mut() {
            placements.sort_by_key(|w| w.position);
        }
        Ok(areas)
    }
}
