use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use ulid::Ulid;

use crate::build::cancel::CancelToken;
use crate::build::context::{PageRenderRecord, ResolvedAsset};
use crate::build::fingerprint::{self, DependencyInputs};
use crate::build::locale::{LocaleSpec, ResolvedLocales};
use crate::build::output;
use crate::build::stages::load::LoadedPage;
use crate::content::{ContentTranslation, MenuNode, Template, Theme};
use crate::error::{BuildError, ServiceError};
use crate::service::{MenuService, Services};
use crate::theme::manifest::{self, ThemeSelection};

type MenuSlot = Arc<Mutex<Option<Vec<MenuNode>>>>;

/// 单次构建内的菜单缓存，每个（语言，别名）最多解析一次，返回深拷贝
pub struct MenuCache<'a> {
    service: Option<&'a dyn MenuService>,
    entries: Mutex<HashMap<(String, String), MenuSlot>>,
}

impl<'a> MenuCache<'a> {
    pub fn new(service: Option<&'a dyn MenuService>) -> Self {
        Self {
            service,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(
        &self,
        locale: &str,
        alias: &str,
        menu_code: &str,
    ) -> Result<Vec<MenuNode>, BuildError> {
        let Some(service) = self.service else {
            return Ok(Vec::new());
        };

        // 先取出槽位再释放外层锁，不同键的解析互不阻塞
        let slot = self
            .entries
            .lock()
            .entry((locale.to_ascii_lowercase(), alias.to_owned()))
            .or_default()
            .clone();

        let mut slot = slot.lock();
        if let Some(tree) = slot.as_ref() {
            return Ok(tree.clone());
        }

        let tree = match service.resolve_navigation(menu_code, locale) {
            Ok(tree) => tree,
            Err(e) if e.is_absence() => {
                tracing::debug!("菜单 {menu_code}（{locale}）不存在，按空菜单处理");
                Vec::new()
            }
            Err(e) => {
                return Err(BuildError::service(
                    format!("解析菜单 {menu_code}（{locale}）失败"),
                    e,
                ));
            }
        };
        *slot = Some(tree.clone());
        Ok(tree)
    }
}

/// 页面模板与主题的解析结果
#[derive(Debug, Clone, Default)]
struct Presentation {
    template: Option<Arc<Template>>,
    /// 模板源文件摘要
    source: Option<Arc<str>>,
    theme: Option<Arc<Theme>>,
    selection: Option<Arc<ThemeSelection>>,
}

/// 构建上下文组装器：把加载的页面展开为（页面，语言）渲染记录
pub struct ContextAssembler<'a> {
    services: &'a Services,
    menu_aliases: &'a BTreeMap<String, String>,
    theme_variant: Option<&'a str>,
    cancel: &'a CancelToken,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(
        services: &'a Services,
        menu_aliases: &'a BTreeMap<String, String>,
        theme_variant: Option<&'a str>,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            services,
            menu_aliases,
            theme_variant,
            cancel,
        }
    }

    pub fn assemble(
        &self,
        pages: &[LoadedPage],
        locales: &ResolvedLocales,
    ) -> Result<Vec<PageRenderRecord>, BuildError> {
        // 模板与主题缓存在并发阶段之前单线程填充，之后只读
        let presentations = self.resolve_presentations(pages)?;
        let menus = MenuCache::new(self.services.menus.as_deref());
        let codes = locales.codes();

        let per_page: Vec<Vec<PageRenderRecord>> = pages
            .par_iter()
            .map(|loaded| {
                if self.cancel.is_cancelled() {
                    return Err(BuildError::Cancelled);
                }
                let presentation = loaded
                    .page
                    .template_id
                    .and_then(|id| presentations.get(&id))
                    .cloned()
                    .unwrap_or_default();
                self.records_for(loaded, &presentation, locales, &codes, &menus)
            })
            .collect::<Result<_, _>>()?;

        Ok(per_page.into_iter().flatten().collect())
    }

    fn resolve_presentations(
        &self,
        pages: &[LoadedPage],
    ) -> Result<HashMap<Ulid, Presentation>, BuildError> {
        let mut themes: HashMap<Ulid, (Option<Arc<Theme>>, Option<Arc<ThemeSelection>>)> =
            HashMap::new();
        let mut presentations: HashMap<Ulid, Presentation> = HashMap::new();

        for loaded in pages {
            let Some(template_id) = loaded.page.template_id else {
                continue;
            };
            if presentations.contains_key(&template_id) {
                continue;
            }

            let template = self.template(template_id)?.map(Arc::new);
            let (theme, selection) = match template.as_ref().and_then(|t| t.theme_id) {
                Some(theme_id) => match themes.get(&theme_id) {
                    Some(cached) => cached.clone(),
                    None => {
                        let resolved = self.theme(theme_id)?;
                        themes.insert(theme_id, resolved.clone());
                        resolved
                    }
                },
                None => (None, None),
            };
            let source = self.template_source(template.as_deref(), selection.as_deref());

            presentations.insert(
                template_id,
                Presentation {
                    template,
                    source,
                    theme,
                    selection,
                },
            );
        }

        tracing::debug!(
            "已解析 {} 个模板、{} 个主题",
            presentations.len(),
            themes.len()
        );
        Ok(presentations)
    }

    fn template_source(
        &self,
        template: Option<&Template>,
        selection: Option<&ThemeSelection>,
    ) -> Option<Arc<str>> {
        let name = template?.identifier()?;
        let renderer = self.services.renderer.as_deref()?;
        renderer.source_digest(name, selection).map(Arc::from)
    }

    fn template(&self, id: Ulid) -> Result<Option<Template>, BuildError> {
        let Some(themes) = self.services.themes.as_deref() else {
            return Ok(None);
        };
        absent_as_none(themes.get_template(id), || format!("模板 {id}"))
    }

    fn theme(
        &self,
        id: Ulid,
    ) -> Result<(Option<Arc<Theme>>, Option<Arc<ThemeSelection>>), BuildError> {
        let Some(themes) = self.services.themes.as_deref() else {
            return Ok((None, None));
        };
        let Some(theme) = absent_as_none(themes.get_theme(id), || format!("主题 {id}"))? else {
            return Ok((None, None));
        };

        let selection = match self.services.theme_selector.as_deref() {
            Some(selector) => absent_as_none(selector.select(&theme, self.theme_variant), || {
                format!("主题 {} 的变体", theme.slug)
            })?,
            None => Some(manifest::select_variant(&theme, self.theme_variant)),
        };
        Ok((Some(Arc::new(theme)), selection.map(Arc::new)))
    }

    fn records_for(
        &self,
        loaded: &LoadedPage,
        presentation: &Presentation,
        locales: &ResolvedLocales,
        codes: &[String],
        menus: &MenuCache<'_>,
    ) -> Result<Vec<PageRenderRecord>, BuildError> {
        let page = &loaded.page;
        let content = &loaded.content;
        let alternates = alternates(loaded, locales);

        let content_translations: HashMap<Ulid, &ContentTranslation> = content
            .translations
            .iter()
            .map(|tr| (tr.locale_id, tr))
            .collect();

        let assets = match &presentation.selection {
            Some(selection) => self.resolve_assets(selection)?,
            None => Vec::new(),
        };

        let mut records = Vec::new();
        for locale in &locales.ordered {
            let Some(translation) = page.translation_for(locale.id) else {
                continue;
            };
            if !translation.has_route() {
                tracing::debug!("页面 {} 在 {} 下没有路由，跳过", page.slug, locale.code);
                continue;
            }
            let Some(content_translation) = content_translations
                .get(&locale.id)
                .or_else(|| content_translations.get(&locales.default.id))
                .copied()
            else {
                tracing::debug!("页面 {} 在 {} 下缺少内容翻译，跳过", page.slug, locale.code);
                continue;
            };

            let blocks = match self.services.blocks.as_deref() {
                Some(service) => absent_as_empty(service.list_for_page(page.id, locale.id), || {
                    format!("加载页面 {} 的区块", page.id)
                })?,
                None => Vec::new(),
            };
            let widgets = match self.services.widgets.as_deref() {
                Some(service) => absent_as_empty(service.resolve_areas(page.id, locale.id), || {
                    format!("加载页面 {} 的挂件", page.id)
                })?,
                None => BTreeMap::new(),
            };

            let mut navigation = BTreeMap::new();
            for (alias, menu_code) in self.menu_aliases {
                navigation.insert(alias.clone(), menus.resolve(&locale.code, alias, menu_code)?);
            }

            let metadata = fingerprint::compute(&DependencyInputs {
                page,
                page_translation: translation,
                content,
                content_translation: Some(content_translation),
                blocks: &blocks,
                widgets: &widgets,
                menus: &navigation,
                template: presentation.template.as_deref(),
                template_source: presentation.source.as_deref(),
                theme: presentation.theme.as_deref(),
                selection: presentation.selection.as_deref(),
                locales: codes,
                alternates: &alternates,
            });

            records.push(PageRenderRecord {
                page: page.clone(),
                locale: locale.clone(),
                translation: translation.clone(),
                content: content.clone(),
                content_translation: content_translation.clone(),
                blocks,
                widgets,
                menus: navigation,
                template: presentation.template.clone(),
                theme: presentation.theme.clone(),
                selection: presentation.selection.clone(),
                assets: assets.clone(),
                alternates: alternates.clone(),
                metadata,
            });
        }
        Ok(records)
    }

    fn resolve_assets(&self, selection: &ThemeSelection) -> Result<Vec<ResolvedAsset>, BuildError> {
        let mut resolved = Vec::with_capacity(selection.assets.len());
        for asset in &selection.assets {
            let path = match self.services.assets.as_deref() {
                Some(resolver) => match resolver.resolve_path(selection, asset) {
                    Ok(path) => path,
                    Err(e) if e.is_absence() => {
                        tracing::warn!("主题 {} 缺少资源 {asset}，已忽略", selection.theme_slug);
                        continue;
                    }
                    Err(source) => {
                        return Err(BuildError::Asset {
                            theme: selection.theme_slug.clone(),
                            asset: asset.clone(),
                            source,
                        });
                    }
                },
                None => default_asset_path(selection, asset),
            };
            let path = output::join_relative("", &path);
            resolved.push(ResolvedAsset {
                theme_id: selection.theme_id,
                theme_slug: selection.theme_slug.clone(),
                source: asset.clone(),
                url: format!("/assets/{path}"),
                path,
            });
        }
        Ok(resolved)
    }
}

/// 资源在输出目录 assets/ 下的默认位置
pub fn default_asset_path(selection: &ThemeSelection, asset: &str) -> String {
    output::join_relative(&selection.asset_base, asset)
}

/// 页面在各构建语言下的 URL
fn alternates(loaded: &LoadedPage, locales: &ResolvedLocales) -> BTreeMap<String, String> {
    locales
        .ordered
        .iter()
        .filter_map(|locale: &LocaleSpec| {
            let tr = loaded.page.translation_for(locale.id)?;
            tr.has_route().then(|| {
                (
                    locale.code.clone(),
                    output::public_url(&tr.path, &locale.code, &locales.default.code),
                )
            })
        })
        .collect()
}

fn absent_as_none<T>(
    result: Result<T, ServiceError>,
    what: impl FnOnce() -> String,
) -> Result<Option<T>, BuildError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_absence() => {
            tracing::warn!("{}不可用，按缺失处理：{e}", what());
            Ok(None)
        }
        Err(e) => Err(BuildError::service(format!("解析{}失败", what()), e)),
    }
}

fn absent_as_empty<T: Default>(
    result: Result<T, ServiceError>,
    what: impl FnOnce() -> String,
) -> Result<T, BuildError> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_absence() => Ok(T::default()),
        Err(e) => Err(BuildError::service(format!("{}失败", what()), e)),
    }
}
