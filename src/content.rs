use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::theme::manifest::ThemeManifest;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Draft,
    Published,
    Archived,
}

impl ContentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

/// 语言记录，`id` 是稳定标识，`code` 允许改名
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Locale {
    pub id: Ulid,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentType {
    pub id: Ulid,
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

/// 内容记录（页面即 `page` 类型的内容）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: Ulid,
    pub content_type_id: Ulid,
    pub slug: String,
    pub status: ContentStatus,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub translations: Vec<ContentTranslation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Content {
    pub fn is_visible(&self) -> bool {
        self.visible && self.status == ContentStatus::Published
    }

    pub fn translation_for(&self, locale_id: Ulid) -> Option<&ContentTranslation> {
        self.translations.iter().find(|t| t.locale_id == locale_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentTranslation {
    pub id: Ulid,
    pub locale_id: Ulid,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    /// 任意结构的正文数据
    #[serde(default)]
    pub fields: Value,
    pub updated_at: DateTime<Utc>,
}

impl ContentTranslation {
    /// 读取 `fields` 中的字符串字段，空串视为不存在
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// 由页面类型内容映射出的页面
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub id: Ulid,
    pub content_id: Ulid,
    pub slug: String,
    pub status: ContentStatus,
    pub template_id: Option<Ulid>,
    pub parent_id: Option<Ulid>,
    pub translations: Vec<PageTranslation>,
    pub metadata: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl Page {
    pub fn translation_for(&self, locale_id: Ulid) -> Option<&PageTranslation> {
        self.translations.iter().find(|t| t.locale_id == locale_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageTranslation {
    pub id: Ulid,
    pub locale_id: Ulid,
    pub title: String,
    /// 路由路径，可能为空（即该语言下无可用路由）
    pub path: String,
    pub summary: Option<String>,
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PageTranslation {
    pub fn has_route(&self) -> bool {
        !self.path.trim().is_empty()
    }
}

/// 页面区块实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub definition: String,
    #[serde(default)]
    pub area: String,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub locale_id: Option<Ulid>,
    #[serde(default)]
    pub config: Value,
    pub updated_at: DateTime<Utc>,
}

/// 挂件在某个区域的放置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetPlacement {
    pub id: Ulid,
    pub definition: String,
    pub area: String,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub config: Value,
    pub updated_at: DateTime<Utc>,
}

/// 导航树节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MenuNode {
    #[serde(default)]
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub children: Vec<MenuNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Ulid,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    /// 渲染器使用的模板路径，优先于 slug
    #[serde(default)]
    pub template_path: String,
    #[serde(default)]
    pub theme_id: Option<Ulid>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// 渲染器标识：优先模板路径，其次 slug
    pub fn identifier(&self) -> Option<&str> {
        [self.template_path.trim(), self.slug.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub id: Ulid,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub manifest: ThemeManifest,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}
