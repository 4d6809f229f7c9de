//! 页面依赖指纹，用于增量构建的变更检测。
//!
//! 每个参与渲染的实体生成一个指纹字符串：普通实体为 `|` 拼接的标识、可变字段与
//! 纳秒精度 UTC 更新时间；携带任意结构数据的实体（内容翻译正文、区块配置）先做
//! 规范化 JSON（对象键递归排序、数组保持顺序）再取 SHA-256。集合类来源逐项哈希后
//! 排序、以 `\0` 分隔拼接再哈希，与顺序无关。页面总哈希对 `名称=指纹` 同样处理。
//! 给定相同输入，结果跨进程、跨运行保持一致。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::content::{
    Block, Content, ContentTranslation, MenuNode, Page, PageTranslation, Template, Theme,
    WidgetPlacement,
};
use crate::theme::manifest::ThemeSelection;

pub const SOURCE_PAGE: &str = "page";
pub const SOURCE_PAGE_TRANSLATION: &str = "page_translation";
pub const SOURCE_CONTENT: &str = "content";
pub const SOURCE_CONTENT_TRANSLATION: &str = "content_translation";
pub const SOURCE_BLOCKS: &str = "blocks";
pub const SOURCE_WIDGETS: &str = "widgets";
pub const SOURCE_MENUS: &str = "menus";
pub const SOURCE_TEMPLATE: &str = "template";
pub const SOURCE_THEME: &str = "theme";
pub const SOURCE_ALTERNATES: &str = "alternates";

/// 页面的依赖元数据，增量构建唯一依据
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DependencyMetadata {
    pub sources: BTreeMap<String, String>,
    pub hash: String,
    pub last_modified: DateTime<Utc>,
}

/// 计算依赖元数据所需的全部输入，缺失的来源直接省略
pub struct DependencyInputs<'a> {
    pub page: &'a Page,
    pub page_translation: &'a PageTranslation,
    pub content: &'a Content,
    pub content_translation: Option<&'a ContentTranslation>,
    pub blocks: &'a [Block],
    pub widgets: &'a BTreeMap<String, Vec<WidgetPlacement>>,
    pub menus: &'a BTreeMap<String, Vec<MenuNode>>,
    pub template: Option<&'a Template>,
    /// 渲染器给出的模板源文件摘要
    pub template_source: Option<&'a str>,
    pub theme: Option<&'a Theme>,
    pub selection: Option<&'a ThemeSelection>,
    /// 本次构建的语言代码，模板中以 `helpers.locales` 出现
    pub locales: &'a [String],
    /// 语言代码 → 同一页面其它语言版本的 URL
    pub alternates: &'a BTreeMap<String, String>,
}

pub fn compute(inputs: &DependencyInputs<'_>) -> DependencyMetadata {
    let mut sources = BTreeMap::new();
    let mut last_modified = inputs.page.updated_at;
    let mut touch = |ts: DateTime<Utc>| {
        if ts > last_modified {
            last_modified = ts;
        }
    };

    sources.insert(SOURCE_PAGE.to_owned(), page(inputs.page));
    sources.insert(
        SOURCE_PAGE_TRANSLATION.to_owned(),
        page_translation(inputs.page_translation),
    );
    touch(inputs.page_translation.updated_at);

    sources.insert(SOURCE_CONTENT.to_owned(), content(inputs.content));
    touch(inputs.content.updated_at);

    if let Some(tr) = inputs.content_translation {
        sources.insert(SOURCE_CONTENT_TRANSLATION.to_owned(), content_translation(tr));
        touch(tr.updated_at);
    }

    if let Some(fp) = hash_collection(inputs.blocks.iter().map(block)) {
        sources.insert(SOURCE_BLOCKS.to_owned(), fp);
    }
    for b in inputs.blocks {
        touch(b.updated_at);
    }

    let placements = inputs.widgets.values().flatten();
    if let Some(fp) = hash_collection(placements.clone().map(widget)) {
        sources.insert(SOURCE_WIDGETS.to_owned(), fp);
    }
    for w in placements {
        touch(w.updated_at);
    }

    let menus = inputs
        .menus
        .iter()
        .filter(|(_, tree)| !tree.is_empty())
        .map(|(alias, tree)| menu(alias, tree));
    if let Some(fp) = hash_collection(menus) {
        sources.insert(SOURCE_MENUS.to_owned(), fp);
    }

    if let Some(t) = inputs.template {
        sources.insert(
            SOURCE_TEMPLATE.to_owned(),
            template(t, inputs.template_source),
        );
        touch(t.updated_at);
    }

    if let Some(t) = inputs.theme {
        sources.insert(SOURCE_THEME.to_owned(), theme(t, inputs.selection));
        touch(t.updated_at);
    }

    sources.insert(
        SOURCE_ALTERNATES.to_owned(),
        alternates(inputs.locales, inputs.alternates),
    );

    let hash = hash_sources(&sources);
    DependencyMetadata {
        sources,
        hash,
        last_modified,
    }
}

/// 对 `名称=指纹` 排序后以 `\0` 分隔拼接再哈希
pub fn hash_sources(sources: &BTreeMap<String, String>) -> String {
    let mut entries: Vec<String> = sources
        .iter()
        .map(|(name, fp)| format!("{name}={fp}"))
        .collect();
    entries.sort();
    sha256_hex(entries.join("\0").as_bytes())
}

/// 集合指纹：逐项哈希、排序、`\0` 拼接后再哈希；空集合返回 None
pub fn hash_collection<I>(members: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut hashed: Vec<String> = members
        .into_iter()
        .map(|m| sha256_hex(m.as_bytes()))
        .collect();
    if hashed.is_empty() {
        return None;
    }
    hashed.sort();
    Some(sha256_hex(hashed.join("\0").as_bytes()))
}

pub fn page(p: &Page) -> String {
    join(&[
        &p.id.to_string(),
        &p.slug,
        p.status.as_str(),
        &opt_id(p.template_id),
        &opt_id(p.parent_id),
        &timestamp(&p.updated_at),
    ])
}

pub fn page_translation(t: &PageTranslation) -> String {
    join(&[
        &t.id.to_string(),
        &t.locale_id.to_string(),
        &t.title,
        &t.path,
        t.summary.as_deref().unwrap_or_default(),
        t.seo_title.as_deref().unwrap_or_default(),
        t.seo_description.as_deref().unwrap_or_default(),
        &timestamp(&t.updated_at),
    ])
}

pub fn content(c: &Content) -> String {
    join(&[
        &c.id.to_string(),
        &c.content_type_id.to_string(),
        &c.slug,
        c.status.as_str(),
        &digest_map(&c.metadata),
        &timestamp(&c.updated_at),
    ])
}

pub fn content_translation(t: &ContentTranslation) -> String {
    digest_json(&json!({
        "id": t.id.to_string(),
        "locale_id": t.locale_id.to_string(),
        "title": t.title,
        "summary": t.summary,
        "fields": t.fields,
        "updated_at": timestamp(&t.updated_at),
    }))
}

pub fn block(b: &Block) -> String {
    digest_json(&json!({
        "id": b.id.to_string(),
        "definition": b.definition,
        "area": b.area,
        "position": b.position,
        "locale_id": b.locale_id.map(|id| id.to_string()),
        "config": b.config,
        "updated_at": timestamp(&b.updated_at),
    }))
}

pub fn widget(w: &WidgetPlacement) -> String {
    join(&[
        &w.id.to_string(),
        &w.definition,
        &w.area,
        &w.position.to_string(),
        &digest_json(&w.config),
        &timestamp(&w.updated_at),
    ])
}

pub fn menu(alias: &str, tree: &[MenuNode]) -> String {
    let tree = serde_json::to_value(tree).unwrap_or(Value::Null);
    join(&[alias, &digest_json(&tree)])
}

pub fn template(t: &Template, source: Option<&str>) -> String {
    join(&[
        &t.id.to_string(),
        &t.slug,
        &t.template_path,
        &opt_id(t.theme_id),
        source.unwrap_or_default(),
        &timestamp(&t.updated_at),
    ])
}

pub fn theme(t: &Theme, selection: Option<&ThemeSelection>) -> String {
    let selection = selection
        .map(|s| {
            digest_json(&json!({
                "variant": s.variant,
                "asset_base": s.asset_base,
                "assets": s.assets,
                "tokens": s.tokens,
            }))
        })
        .unwrap_or_default();
    join(&[
        &t.id.to_string(),
        &t.slug,
        &t.version,
        &selection,
        &timestamp(&t.updated_at),
    ])
}

/// 语言列表与各语言版本 URL，任一语言版本的路由变化都会影响本页
pub fn alternates(locales: &[String], urls: &BTreeMap<String, String>) -> String {
    let mut fields = vec![locales.join(",")];
    fields.extend(urls.iter().map(|(code, url)| format!("{code}={url}")));
    fields.join("|")
}

/// 纳秒精度的 UTC 时间，保证字典序与时间序一致
pub fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 规范化 JSON 的 SHA-256
pub fn digest_json(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// 规范化 JSON：对象键递归排序，数组保持原顺序，不含空白
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn digest_map(map: &Map<String, Value>) -> String {
    digest_json(&Value::Object(map.clone()))
}

fn join(fields: &[&str]) -> String {
    fields.join("|")
}

fn opt_id(id: Option<ulid::Ulid>) -> String {
    id.map(|id| id.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Fixture;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"y": [3, {"d": 1, "c": 2}], "x": null}});
        let b = json!({"a": {"x": null, "y": [3, {"c": 2, "d": 1}]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"x":null,"y":[3,{"c":2,"d":1}]},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_keeps_array_order() {
        assert_ne!(digest_json(&json!([1, 2])), digest_json(&json!([2, 1])));
    }

    #[test]
    fn collection_hash_ignores_member_order() {
        let a = hash_collection(vec!["x".to_owned(), "y".to_owned()]);
        let b = hash_collection(vec!["y".to_owned(), "x".to_owned()]);
        assert_eq!(a, b);
        assert!(hash_collection(Vec::<String>::new()).is_none());
    }

    #[test]
    fn timestamp_has_nanosecond_precision() {
        let fx = Fixture::new();
        assert_eq!(timestamp(&fx.now), "2025-01-01T00:00:00.000000000Z");
    }

    #[test]
    fn source_hash_depends_on_every_entry() {
        let mut sources = BTreeMap::new();
        sources.insert("page".to_owned(), "a".to_owned());
        let base = hash_sources(&sources);
        sources.insert("template".to_owned(), "b".to_owned());
        let with_template = hash_sources(&sources);
        assert_ne!(base, with_template);
        sources.remove("template");
        assert_eq!(base, hash_sources(&sources));
    }

    #[test]
    fn compute_is_deterministic_and_change_sensitive() {
        let fx = Fixture::new();
        let inputs = fx.dependency_inputs();
        let first = compute(&inputs.as_inputs());
        let second = compute(&inputs.as_inputs());
        assert_eq!(first, second);

        let mut changed = fx.dependency_inputs();
        changed.page_translation.title.push_str(" (edited)");
        assert_ne!(first.hash, compute(&changed.as_inputs()).hash);

        let mut changed = fx.dependency_inputs();
        changed.blocks[0].config["headline"] = json!("Changed");
        let recomputed = compute(&changed.as_inputs());
        assert_ne!(first.hash, recomputed.hash);
        assert_ne!(first.sources[SOURCE_BLOCKS], recomputed.sources[SOURCE_BLOCKS]);
        assert_eq!(first.sources[SOURCE_PAGE], recomputed.sources[SOURCE_PAGE]);

        let mut changed = fx.dependency_inputs();
        changed.menus.get_mut("main").unwrap()[0].label = "Start".into();
        assert_ne!(first.hash, compute(&changed.as_inputs()).hash);
    }

    #[test]
    fn absent_sources_are_omitted() {
        let fx = Fixture::new();
        let mut owned = fx.dependency_inputs();
        owned.blocks.clear();
        owned.template = None;
        owned.theme = None;
        let meta = compute(&owned.as_inputs());
        assert!(!meta.sources.contains_key(SOURCE_BLOCKS));
        assert!(!meta.sources.contains_key(SOURCE_TEMPLATE));
        assert!(!meta.sources.contains_key(SOURCE_THEME));

        let with_blocks = compute(&fx.dependency_inputs().as_inputs());
        assert_ne!(meta.hash, with_blocks.hash);
    }

    #[test]
    fn rendered_inputs_outside_timestamps_change_the_hash() {
        let fx = Fixture::new();
        let base = compute(&fx.dependency_inputs().as_inputs());

        let mut changed = fx.dependency_inputs();
        changed.template_source = Some("edited-template".into());
        let recomputed = compute(&changed.as_inputs());
        assert_ne!(base.sources[SOURCE_TEMPLATE], recomputed.sources[SOURCE_TEMPLATE]);

        let mut changed = fx.dependency_inputs();
        changed.alternates.insert("es".into(), "/es/sobre/".into());
        let recomputed = compute(&changed.as_inputs());
        assert_ne!(base.sources[SOURCE_ALTERNATES], recomputed.sources[SOURCE_ALTERNATES]);
        assert_eq!(base.sources[SOURCE_PAGE_TRANSLATION], recomputed.sources[SOURCE_PAGE_TRANSLATION]);

        let mut changed = fx.dependency_inputs();
        changed.locales.pop();
        assert_ne!(base.hash, compute(&changed.as_inputs()).hash);

        let mut changed = fx.dependency_inputs();
        changed.selection.as_mut().unwrap().tokens.insert("accent".into(), "#f00".into());
        assert_ne!(base.sources[SOURCE_THEME], compute(&changed.as_inputs()).sources[SOURCE_THEME]);

        let mut changed = fx.dependency_inputs();
        changed.selection.as_mut().unwrap().assets.push("css/print.css".into());
        assert_ne!(base.hash, compute(&changed.as_inputs()).hash);

        let mut changed = fx.dependency_inputs();
        changed.content.metadata.insert("layout".into(), json!("wide"));
        assert_ne!(base.sources[SOURCE_CONTENT], compute(&changed.as_inputs()).sources[SOURCE_CONTENT]);
    }

    #[test]
    fn last_modified_is_latest_input() {
        let fx = Fixture::new();
        let mut owned = fx.dependency_inputs();
        let later = fx.now + chrono::Duration::days(3);
        owned.blocks[0].updated_at = later;
        assert_eq!(compute(&owned.as_inputs()).last_modified, later);
    }
}
