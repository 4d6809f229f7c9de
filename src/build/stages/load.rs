use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use ulid::Ulid;

use crate::build::locale::ResolvedLocales;
use crate::content::{Content, Page, PageTranslation};
use crate::error::BuildError;
use crate::service::{ContentService, ContentTypeService};

/// 父页面链的最大深度，超过视为循环
const MAX_PARENT_DEPTH: usize = 32;

/// 加载完成的页面及其背后的内容记录
#[derive(Debug, Clone)]
pub struct LoadedPage {
    pub page: Arc<Page>,
    pub content: Arc<Content>,
}

/// 页面加载器，每次构建一个实例，页面内容类型只解析一次
pub struct PageLoader<'a> {
    contents: &'a dyn ContentService,
    content_types: &'a dyn ContentTypeService,
    page_type_slug: &'a str,
    page_type_id: OnceLock<Ulid>,
}

impl<'a> PageLoader<'a> {
    pub fn new(
        contents: &'a dyn ContentService,
        content_types: &'a dyn ContentTypeService,
        page_type_slug: &'a str,
    ) -> Self {
        Self {
            contents,
            content_types,
            page_type_slug,
            page_type_id: OnceLock::new(),
        }
    }

    pub fn page_type_id(&self) -> Result<Ulid, BuildError> {
        if let Some(id) = self.page_type_id.get() {
            return Ok(*id);
        }
        let content_type = self
            .content_types
            .get_by_slug(self.page_type_slug)
            .map_err(|e| {
                BuildError::service(format!("解析页面内容类型 {} 失败", self.page_type_slug), e)
            })?;
        Ok(*self.page_type_id.get_or_init(|| content_type.id))
    }

    /// 全量构建列出全部页面，局部构建只取请求的页面；不可见页面被过滤
    pub fn load(
        &self,
        page_ids: &[Ulid],
        locales: &ResolvedLocales,
    ) -> Result<Vec<LoadedPage>, BuildError> {
        let type_id = self.page_type_id()?;

        let records: Vec<Content> = if page_ids.is_empty() {
            self.contents
                .list_by_type(type_id)
                .map_err(|e| BuildError::service("列出页面失败", e))?
        } else {
            let mut records = Vec::with_capacity(page_ids.len());
            for id in page_ids {
                if records.iter().any(|c: &Content| c.id == *id) {
                    continue;
                }
                let content = self
                    .contents
                    .get(*id)
                    .map_err(|e| BuildError::service(format!("加载页面 {id} 失败"), e))?;
                if content.content_type_id != type_id {
                    tracing::debug!("内容 {id} 不是页面类型，跳过");
                    continue;
                }
                records.push(content);
            }
            records
        };

        let visible: Vec<Arc<Content>> = records
            .into_iter()
            .filter(|c| {
                let visible = c.is_visible();
                if !visible {
                    tracing::debug!("跳过不可见页面：{}", c.slug);
                }
                visible
            })
            .map(Arc::new)
            .collect();

        let mut pool: HashMap<Ulid, Arc<Content>> =
            visible.iter().map(|c| (c.id, c.clone())).collect();

        let mut pages = Vec::with_capacity(visible.len());
        for content in visible {
            let page = self.map_page(&content, locales, &mut pool)?;
            pages.push(LoadedPage {
                page: Arc::new(page),
                content,
            });
        }
        Ok(pages)
    }

    fn map_page(
        &self,
        content: &Content,
        locales: &ResolvedLocales,
        pool: &mut HashMap<Ulid, Arc<Content>>,
    ) -> Result<Page, BuildError> {
        let mut translations = Vec::with_capacity(content.translations.len());
        for tr in &content.translations {
            let path = self.route_for(content, tr.locale_id, locales.default.id, pool, 0)?;
            translations.push(PageTranslation {
                id: tr.id,
                locale_id: tr.locale_id,
                title: if tr.title.trim().is_empty() {
                    content.slug.clone()
                } else {
                    tr.title.clone()
                },
                path,
                summary: tr.summary.clone(),
                seo_title: tr.field_str("seo_title").map(str::to_owned),
                seo_description: tr.field_str("seo_description").map(str::to_owned),
                updated_at: tr.updated_at,
            });
        }

        Ok(Page {
            id: content.id,
            content_id: content.id,
            slug: content.slug.clone(),
            status: content.status,
            template_id: hint_id(content, "template_id"),
            parent_id: hint_id(content, "parent_id"),
            translations,
            metadata: content.metadata.clone(),
            updated_at: content.updated_at,
        })
    }

    /// 解析页面在某语言下的路由：翻译中的 path → 元数据 path → 父路由 + slug
    fn route_for(
        &self,
        content: &Content,
        locale_id: Ulid,
        default_locale_id: Ulid,
        pool: &mut HashMap<Ulid, Arc<Content>>,
        depth: usize,
    ) -> Result<String, BuildError> {
        let explicit = content
            .translation_for(locale_id)
            .and_then(|tr| tr.field_str("path"))
            .or_else(|| meta_str(&content.metadata, "path"));
        if let Some(path) = explicit {
            return Ok(normalize_route(path));
        }

        let slug = content.slug.trim();
        if slug.is_empty() {
            return Ok(String::new());
        }

        let Some(parent_id) = hint_id(content, "parent_id") else {
            return Ok(normalize_route(slug));
        };
        if depth >= MAX_PARENT_DEPTH || parent_id == content.id {
            return Err(BuildError::UnresolvedParent {
                page_id: content.id,
                parent_id,
            });
        }

        let parent = self.parent(content.id, parent_id, pool)?;
        let locale = if parent.translation_for(locale_id).is_some() {
            locale_id
        } else {
            default_locale_id
        };
        let parent_route = self.route_for(&parent, locale, default_locale_id, pool, depth + 1)?;
        Ok(normalize_route(&format!("{parent_route}/{slug}")))
    }

    fn parent(
        &self,
        page_id: Ulid,
        parent_id: Ulid,
        pool: &mut HashMap<Ulid, Arc<Content>>,
    ) -> Result<Arc<Content>, BuildError> {
        if let Some(parent) = pool.get(&parent_id) {
            return Ok(parent.clone());
        }
        let parent = self.contents.get(parent_id).map_err(|e| {
            if e.is_absence() {
                BuildError::UnresolvedParent { page_id, parent_id }
            } else {
                BuildError::service(format!("加载父页面 {parent_id} 失败"), e)
            }
        })?;
        let parent = Arc::new(parent);
        pool.insert(parent_id, parent.clone());
        Ok(parent)
    }
}

/// 统一为以 `/` 开头、无尾斜杠、无空段的路由，根为 `/`
pub fn normalize_route(route: &str) -> String {
    let segments: Vec<&str> = route
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}

/// 元数据优先，其次任一翻译 fields 中的 ID 提示
fn hint_id(content: &Content, key: &str) -> Option<Ulid> {
    meta_str(&content.metadata, key)
        .or_else(|| content.translations.iter().find_map(|tr| tr.field_str(key)))
        .and_then(|raw| match Ulid::from_string(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!("内容 {} 的 {key} 不是合法 ID：{raw}", content.id);
                None
            }
        })
}

fn meta_str<'m>(metadata: &'m Map<String, Value>, key: &str) -> Option<&'m str> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
