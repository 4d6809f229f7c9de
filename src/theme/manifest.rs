use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use ulid::Ulid;

use crate::content::Theme;

/// theme.toml 中的主题清单
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThemeManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub assets: ThemeAssets,
    #[serde(default)]
    pub default_variant: Option<String>,
    #[serde(default)]
    pub variants: BTreeMap<String, ThemeVariant>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThemeAssets {
    /// 资源在输出目录 assets/ 下的前缀，缺省为主题 slug
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub styles: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl ThemeAssets {
    fn all(&self) -> impl Iterator<Item = &String> {
        self.styles.iter().chain(&self.scripts).chain(&self.images)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThemeVariant {
    #[serde(default)]
    pub assets: ThemeAssets,
    /// 设计变量（颜色、字体等），原样传给模板
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

/// 主题变体选择结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThemeSelection {
    pub theme_id: Ulid,
    pub theme_slug: String,
    /// 输出目录 assets/ 下的主题资源前缀
    pub asset_base: String,
    pub variant: Option<String>,
    /// 主题相对资源路径，去重且保持声明顺序
    pub assets: Vec<String>,
    pub tokens: BTreeMap<String, String>,
}

/// 按请求的变体选择主题资源；请求的变体不存在时回退到清单默认变体
pub fn select_variant(theme: &Theme, requested: Option<&str>) -> ThemeSelection {
    let manifest = &theme.manifest;
    let variant_name = requested
        .filter(|name| manifest.variants.contains_key(*name))
        .or(manifest.default_variant.as_deref())
        .filter(|name| manifest.variants.contains_key(*name))
        .map(str::to_owned);

    let variant = variant_name.as_ref().and_then(|v| manifest.variants.get(v));

    let mut assets: Vec<String> = Vec::new();
    let extra = variant.map(|v| &v.assets);
    for asset in manifest.assets.all().chain(extra.into_iter().flat_map(ThemeAssets::all)) {
        let asset = asset.trim().trim_start_matches('/');
        if asset.is_empty() || assets.iter().any(|a| a == asset) {
            continue;
        }
        assets.push(asset.to_owned());
    }

    ThemeSelection {
        theme_id: theme.id,
        theme_slug: theme.slug.clone(),
        asset_base: manifest
            .assets
            .base
            .as_deref()
            .map(|b| b.trim().trim_matches('/'))
            .filter(|b| !b.is_empty())
            .unwrap_or(theme.slug.as_str())
            .to_owned(),
        variant: variant_name,
        assets,
        tokens: variant.map(|v| v.tokens.clone()).unwrap_or_default(),
    }
}

/// 读取 themes/<slug>/theme.toml
pub fn load_manifest(project_root: &Path, theme_slug: &str) -> Result<ThemeManifest> {
    let path = project_root
        .join("themes")
        .join(theme_slug)
        .join("theme.toml");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("读取 theme.toml 失败: {}", path.display()))?;
    let manifest: ThemeManifest = toml::from_str(&content)
        .with_context(|| format!("解析 theme.toml 失败: {}", path.display()))?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn theme_with(manifest: ThemeManifest) -> Theme {
        Theme {
            id: Ulid::new(),
            slug: "aurora".into(),
            name: "Aurora".into(),
            version: "1.0.0".into(),
            manifest,
            updated_at: Utc::now(),
        }
    }

    fn manifest() -> ThemeManifest {
        toml::from_str(
            r##"
            name = "aurora"
            version = "1.0.0"
            default_variant = "light"

            [assets]
            styles = ["css/main.css"]
            scripts = ["/js/app.js"]

            [variants.light.tokens]
            bg = "#fff"

            [variants.dark.assets]
            styles = ["css/dark.css", "css/main.css"]

            [variants.dark.tokens]
            bg = "#000"
            "##,
        )
        .unwrap()
    }

    #[test]
    fn requested_variant_adds_its_assets() {
        let selection = select_variant(&theme_with(manifest()), Some("dark"));
        assert_eq!(selection.variant.as_deref(), Some("dark"));
        assert_eq!(selection.assets, vec!["css/main.css", "js/app.js", "css/dark.css"]);
        assert_eq!(selection.tokens["bg"], "#000");
    }

    #[test]
    fn unknown_variant_falls_back_to_default() {
        let selection = select_variant(&theme_with(manifest()), Some("sepia"));
        assert_eq!(selection.variant.as_deref(), Some("light"));
        assert_eq!(selection.tokens["bg"], "#fff");
    }

    #[test]
    fn theme_without_variants_selects_none() {
        let selection = select_variant(&theme_with(ThemeManifest::default()), None);
        assert!(selection.variant.is_none());
        assert!(selection.assets.is_empty());
        assert_eq!(selection.asset_base, "aurora");
    }
}
