//! 测试共用的内容图与协作方替身。

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use ulid::Ulid;

use crate::build::cancel::CancelToken;
use crate::build::context::{BuildContext, TemplateContext};
use crate::build::fingerprint::DependencyInputs;
use crate::build::locale::{LocaleSpec, ResolvedLocales};
use crate::build::pipeline::{BuildRequest, Builder};
use crate::build::stages::load::PageLoader;
use crate::build::writer::{ArtifactCategory, ArtifactWriter, WriteRequest};
use crate::config::SiteConfig;
use crate::content::{
    Block, Content, ContentStatus, ContentTranslation, ContentType, Locale, MenuNode, Page,
    PageTranslation, Template, Theme, WidgetPlacement,
};
use crate::error::StorageError;
use crate::service::memory::{ContentSnapshot, MemoryStore};
use crate::service::{BlockService, Services, TemplateRenderer, WidgetService};
use crate::theme::manifest::{ThemeAssets, ThemeManifest, ThemeSelection, select_variant};

/// 三种语言、三个可见页面（home、company、其子页面 team）与一个草稿页面
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub snapshot: ContentSnapshot,
    pub writer: Arc<RecordingWriter>,
    pub now: DateTime<Utc>,
    pub en: Locale,
    pub es: Locale,
    pub fr: Locale,
    pub page_type: ContentType,
    pub template: Template,
    pub theme: Theme,
    pub home_id: Ulid,
    pub company_id: Ulid,
    pub team_id: Ulid,
    pub draft_id: Ulid,
}

impl Fixture {
    pub fn new() -> Self {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let locale = |code: &str| Locale {
            id: Ulid::new(),
            code: code.into(),
        };
        let (en, es, fr) = (locale("en"), locale("es"), locale("fr"));

        let page_type = ContentType {
            id: Ulid::new(),
            slug: "page".into(),
            name: "Page".into(),
        };
        let post_type = ContentType {
            id: Ulid::new(),
            slug: "post".into(),
            name: "Post".into(),
        };

        let theme = Theme {
            id: Ulid::new(),
            slug: "aurora".into(),
            name: "Aurora".into(),
            version: "1.0.0".into(),
            manifest: ThemeManifest {
                name: "aurora".into(),
                version: "1.0.0".into(),
                assets: ThemeAssets {
                    base: None,
                    styles: vec!["css/main.css".into()],
                    scripts: vec!["js/app.js".into()],
                    images: Vec::new(),
                },
                default_variant: None,
                variants: BTreeMap::new(),
            },
            updated_at: now,
        };
        let template = Template {
            id: Ulid::new(),
            slug: "page".into(),
            name: "Page".into(),
            template_path: String::new(),
            theme_id: Some(theme.id),
            updated_at: now,
        };

        let translation = |locale: &Locale, title: &str, fields: Value| ContentTranslation {
            id: Ulid::new(),
            locale_id: locale.id,
            title: title.into(),
            summary: Some(format!("{title} summary")),
            fields,
            updated_at: now,
        };
        let content = |type_id: Ulid, slug: &str, status: ContentStatus, metadata: Value| Content {
            id: Ulid::new(),
            content_type_id: type_id,
            slug: slug.into(),
            status,
            visible: true,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            translations: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let mut home = content(
            page_type.id,
            "home",
            ContentStatus::Published,
            json!({"template_id": template.id.to_string(), "path": "/"}),
        );
        home.translations = vec![
            translation(&en, "Home", json!({"body": "Welcome"})),
            translation(&es, "Inicio", json!({"body": "Bienvenido"})),
        ];

        let mut company = content(
            page_type.id,
            "company",
            ContentStatus::Published,
            json!({"template_id": template.id.to_string()}),
        );
        company.translations = vec![
            translation(&en, "Company", json!({"body": "About us"})),
            translation(&es, "Empresa", json!({"body": "Nosotros", "path": "/empresa"})),
        ];

        let mut team = content(
            page_type.id,
            "team",
            ContentStatus::Published,
            json!({"template_id": template.id.to_string(), "parent_id": company.id.to_string()}),
        );
        team.translations = vec![translation(&en, "Team", json!({"body": "People"}))];

        let mut draft = content(page_type.id, "draft", ContentStatus::Draft, json!({}));
        draft.translations = vec![translation(&en, "Draft", json!({}))];

        let mut post = content(post_type.id, "hello", ContentStatus::Published, json!({}));
        post.translations = vec![translation(&en, "Hello", json!({}))];

        let node = |label: &str, url: &str| MenuNode {
            id: Ulid::new().to_string(),
            label: label.into(),
            url: url.into(),
            target: None,
            children: Vec::new(),
        };
        let mut menus = BTreeMap::new();
        menus.insert(
            "primary-nav".to_owned(),
            BTreeMap::from([
                ("en".to_owned(), vec![node("Home", "/"), node("Company", "/company/")]),
                ("es".to_owned(), vec![node("Inicio", "/es/"), node("Empresa", "/es/empresa/")]),
            ]),
        );

        let blocks = BTreeMap::from([(
            home.id,
            vec![Block {
                id: Ulid::new(),
                definition: "hero".into(),
                area: "main".into(),
                position: 0,
                locale_id: None,
                config: json!({"headline": "Hello", "cta": {"label": "Go", "href": "/company"}}),
                updated_at: now,
            }],
        )]);
        let widgets = BTreeMap::from([(
            company.id,
            vec![WidgetPlacement {
                id: Ulid::new(),
                definition: "contact".into(),
                area: "sidebar".into(),
                position: 0,
                config: json!({"email": "hi@example.com"}),
                updated_at: now,
            }],
        )]);

        let (home_id, company_id, team_id, draft_id) = (home.id, company.id, team.id, draft.id);
        let snapshot = ContentSnapshot {
            locales: vec![en.clone(), es.clone(), fr.clone()],
            content_types: vec![page_type.clone(), post_type],
            contents: vec![home, company, team, draft, post],
            templates: vec![template.clone()],
            themes: vec![theme.clone()],
            menus,
            blocks,
            widgets,
        };

        Self {
            store: Arc::new(MemoryStore::new(snapshot.clone())),
            snapshot,
            writer: Arc::new(RecordingWriter::default()),
            now,
            en,
            es,
            fr,
            page_type,
            template,
            theme,
            home_id,
            company_id,
            team_id,
            draft_id,
        }
    }

    pub fn locales(&self) -> ResolvedLocales {
        let spec = |locale: &Locale, is_default: bool| LocaleSpec {
            code: locale.code.clone(),
            id: locale.id,
            is_default,
        };
        ResolvedLocales {
            default: spec(&self.en, true),
            ordered: vec![spec(&self.en, true), spec(&self.es, false), spec(&self.fr, false)],
        }
    }

    pub fn config(&self) -> SiteConfig {
        SiteConfig::parse(
            r#"
            [site]
            title = "Example"
            description = "An example site"
            url = "https://example.com/"
            author = "Ada"

            [build]
            default_locale = "en"
            locales = ["en", "es", "fr"]
            workers = 2

            [build.menus]
            main = "primary-nav"
            "#,
        )
        .unwrap()
    }

    /// 内存仓库 + 桩渲染器 + 记录写入
    pub fn services(&self) -> Services {
        Services::from_store(self.store.clone())
            .with_renderer(Arc::new(StubRenderer::default()))
            .with_writer(self.writer.clone())
    }

    pub fn context(&self) -> BuildContext {
        Builder::new(self.config(), self.services())
            .assemble(&BuildRequest::default(), &CancelToken::new())
            .unwrap()
    }

    /// 增加一个父页面不存在的页面
    pub fn add_orphan_page(&mut self) -> Ulid {
        let id = Ulid::new();
        let mut metadata = Map::new();
        metadata.insert("parent_id".into(), Value::String(Ulid::new().to_string()));
        self.snapshot.contents.push(Content {
            id,
            content_type_id: self.page_type.id,
            slug: "orphan".into(),
            status: ContentStatus::Published,
            visible: true,
            metadata,
            translations: vec![ContentTranslation {
                id: Ulid::new(),
                locale_id: self.en.id,
                title: "Orphan".into(),
                summary: None,
                fields: json!({}),
                updated_at: self.now,
            }],
            created_at: self.now,
            updated_at: self.now,
        });
        self.store = Arc::new(MemoryStore::new(self.snapshot.clone()));
        id
    }

    /// 在 `root/themes/aurora/assets/` 下写入主题清单列出的资源
    pub fn write_theme_assets(&self, root: &Path) {
        let assets = root.join("themes/aurora/assets");
        std::fs::create_dir_all(assets.join("css")).unwrap();
        std::fs::create_dir_all(assets.join("js")).unwrap();
        std::fs::write(assets.join("css/main.css"), "body { margin: 0 }").unwrap();
        std::fs::write(assets.join("js/app.js"), "console.log('aurora')").unwrap();
    }

    /// home 页面英文版的全部依赖输入
    pub fn dependency_inputs(&self) -> OwnedInputs {
        let locales = self.locales();
        let pages = PageLoader::new(self.store.as_ref(), self.store.as_ref(), "page")
            .load(&[self.home_id], &locales)
            .unwrap();
        let page = (*pages[0].page).clone();
        let content = (*pages[0].content).clone();
        let page_translation = page.translation_for(self.en.id).unwrap().clone();
        let content_translation = content.translation_for(self.en.id).cloned();
        let menus = BTreeMap::from([(
            "main".to_owned(),
            self.snapshot.menus["primary-nav"]["en"].clone(),
        )]);

        OwnedInputs {
            blocks: self.store.list_for_page(page.id, self.en.id).unwrap(),
            widgets: self.store.resolve_areas(page.id, self.en.id).unwrap(),
            selection: Some(select_variant(&self.theme, None)),
            page,
            page_translation,
            content,
            content_translation,
            menus,
            template: Some(self.template.clone()),
            template_source: None,
            theme: Some(self.theme.clone()),
            locales: locales.codes(),
            alternates: BTreeMap::from([
                ("en".to_owned(), "/".to_owned()),
                ("es".to_owned(), "/es/".to_owned()),
            ]),
        }
    }
}

/// 可修改的依赖输入副本
pub struct OwnedInputs {
    pub page: Page,
    pub page_translation: PageTranslation,
    pub content: Content,
    pub content_translation: Option<ContentTranslation>,
    pub blocks: Vec<Block>,
    pub widgets: BTreeMap<String, Vec<WidgetPlacement>>,
    pub menus: BTreeMap<String, Vec<MenuNode>>,
    pub template: Option<Template>,
    pub template_source: Option<String>,
    pub theme: Option<Theme>,
    pub selection: Option<ThemeSelection>,
    pub locales: Vec<String>,
    pub alternates: BTreeMap<String, String>,
}

impl OwnedInputs {
    pub fn as_inputs(&self) -> DependencyInputs<'_> {
        DependencyInputs {
            page: &self.page,
            page_translation: &self.page_translation,
            content: &self.content,
            content_translation: self.content_translation.as_ref(),
            blocks: &self.blocks,
            widgets: &self.widgets,
            menus: &self.menus,
            template: self.template.as_ref(),
            template_source: self.template_source.as_deref(),
            theme: self.theme.as_ref(),
            selection: self.selection.as_ref(),
            locales: &self.locales,
            alternates: &self.alternates,
        }
    }
}

/// 输出只依赖页面内容的确定性 HTML
#[derive(Default)]
pub struct StubRenderer {
    fail_slugs: Vec<String>,
    panic_slugs: Vec<String>,
    cancel_on: Option<(String, CancelToken)>,
}

impl StubRenderer {
    pub fn failing_on(slug: &str) -> Self {
        Self {
            fail_slugs: vec![slug.to_owned()],
            ..Default::default()
        }
    }

    pub fn panicking_on(slug: &str) -> Self {
        Self {
            panic_slugs: vec![slug.to_owned()],
            ..Default::default()
        }
    }

    /// 渲染到该页面时触发取消
    pub fn cancel_after(mut self, slug: &str, token: CancelToken) -> Self {
        self.cancel_on = Some((slug.to_owned(), token));
        self
    }
}

impl TemplateRenderer for StubRenderer {
    fn render(&self, template: &str, context: &TemplateContext) -> anyhow::Result<String> {
        let page = &context.page;
        if let Some((slug, token)) = &self.cancel_on
            && *slug == page.slug
        {
            token.cancel();
        }
        if self.panic_slugs.contains(&page.slug) {
            panic!("boom on {}", page.slug);
        }
        if self.fail_slugs.contains(&page.slug) {
            anyhow::bail!("template exploded on {}", page.slug);
        }
        Ok(format!(
            "<html lang=\"{}\"><title>{}</title><main data-template=\"{template}\">{}</main></html>",
            page.locale, page.title, page.url
        ))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub path: String,
    pub category: ArtifactCategory,
    pub content_type: String,
    pub checksum: String,
    pub metadata: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// 把所有写入记录在内存中
#[derive(Default)]
pub struct RecordingWriter {
    writes: Mutex<Vec<RecordedWrite>>,
    dirs: Mutex<Vec<String>>,
}

impl RecordingWriter {
    pub fn paths(&self) -> Vec<String> {
        self.writes.lock().iter().map(|w| w.path.clone()).collect()
    }

    pub fn paths_in(&self, category: ArtifactCategory) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.category == category)
            .map(|w| w.path.clone())
            .collect()
    }

    pub fn ensured_dirs(&self) -> Vec<String> {
        self.dirs.lock().clone()
    }

    pub fn request(&self, path: &str) -> RecordedWrite {
        self.writes
            .lock()
            .iter()
            .rev()
            .find(|w| w.path == path)
            .cloned()
            .unwrap_or_else(|| panic!("no write to {path}"))
    }

    pub fn body(&self, path: &str) -> String {
        String::from_utf8(self.request(path).body).unwrap()
    }
}

impl ArtifactWriter for RecordingWriter {
    fn ensure_dir(&self, dir: &str) -> Result<(), StorageError> {
        self.dirs.lock().push(dir.to_owned());
        Ok(())
    }

    fn write_file(&self, mut request: WriteRequest) -> Result<(), StorageError> {
        let mut body = Vec::new();
        request.reader.read_to_end(&mut body)?;
        self.writes.lock().push(RecordedWrite {
            path: request.path,
            category: request.category,
            content_type: request.content_type,
            checksum: request.checksum,
            metadata: request.metadata,
            body,
        });
        Ok(())
    }
}
