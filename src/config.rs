use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const CONFIG_FILE: &str = "site.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub site: SiteInfo,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub robots: RobotsConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteInfo {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// 站点根 URL，用于 sitemap、robots 与 feed
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub author: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_content_file")]
    pub content_file: String,
    #[serde(default = "default_locale")]
    pub default_locale: String,
    /// 未显式指定语言时构建的语言列表
    #[serde(default)]
    pub locales: Vec<String>,
    /// 渲染线程数，0 表示使用可用并行度
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_page_content_type")]
    pub page_content_type: String,
    #[serde(default)]
    pub theme_variant: Option<String>,
    /// 菜单别名 → 菜单编码
    #[serde(default)]
    pub menus: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_true")]
    pub sitemap: bool,
    #[serde(default = "default_true")]
    pub robots: bool,
    #[serde(default = "default_true")]
    pub assets: bool,
    #[serde(default = "default_true")]
    pub feeds: bool,
    #[serde(default = "default_true")]
    pub incremental: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RobotsConfig {
    #[serde(default)]
    pub disallow: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_count")]
    pub post_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl SiteConfig {
    pub fn load(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("读取 {CONFIG_FILE} 失败：{}", e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: SiteConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("解析 {CONFIG_FILE} 失败：{}", e))?;
        Ok(config)
    }
}

// 默认值函数
fn default_output_dir() -> String { "public".into() }
fn default_cache_dir() -> String { ".cache".into() }
fn default_content_file() -> String { "content.json".into() }
fn default_locale() -> String { "en".into() }
fn default_page_content_type() -> String { "page".into() }
fn default_true() -> bool { true }
fn default_feed_count() -> usize { 20 }
fn default_log_level() -> String { "info".into() }

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            cache_dir: default_cache_dir(),
            content_file: default_content_file(),
            default_locale: default_locale(),
            locales: Vec::new(),
            workers: 0,
            page_content_type: default_page_content_type(),
            theme_variant: None,
            menus: BTreeMap::new(),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sitemap: true,
            robots: true,
            assets: true,
            feeds: true,
            incremental: true,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            post_count: default_feed_count(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}
