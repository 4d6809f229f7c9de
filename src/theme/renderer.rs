use anyhow::{Context, Result};
use minijinja::{Environment, Error, ErrorKind, State, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::build::context::TemplateContext;
use crate::build::fingerprint::{hash_collection, sha256_hex};
use crate::build::output;
use crate::service::TemplateRenderer;
use crate::theme::manifest::ThemeSelection;

/// 基于 MiniJinja 的模板渲染器。
///
/// 有主题的页面从 `themes/<slug>/templates/` 加载模板，无主题的页面从项目根下
/// `templates/` 加载；每个目录一个 Environment，首次使用时创建。
pub struct MiniJinjaRenderer {
    project_root: PathBuf,
    envs: Mutex<HashMap<PathBuf, Arc<Environment<'static>>>>,
}

impl MiniJinjaRenderer {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            envs: Mutex::new(HashMap::new()),
        }
    }

    fn templates_dir(&self, theme: Option<&ThemeSelection>) -> PathBuf {
        match theme {
            Some(theme) => self
                .project_root
                .join("themes")
                .join(&theme.theme_slug)
                .join("templates"),
            None => self.project_root.join("templates"),
        }
    }

    fn env(&self, templates_dir: PathBuf) -> Arc<Environment<'static>> {
        self.envs
            .lock()
            .entry(templates_dir)
            .or_insert_with_key(|dir| {
                if !dir.exists() {
                    tracing::warn!("模板目录不存在：{}", dir.display());
                }
                let mut env = Environment::new();
                env.set_loader(minijinja::path_loader(dir.clone()));
                register_functions(&mut env);
                Arc::new(env)
            })
            .clone()
    }
}

/// 查找模板：先按原名，无扩展名时再尝试 `.html`
fn find_template<'e>(env: &'e Environment<'static>, name: &str) -> Result<minijinja::Template<'e, 'e>> {
    match env.get_template(name) {
        Ok(tmpl) => Ok(tmpl),
        Err(e) if e.kind() == ErrorKind::TemplateNotFound && !name.contains('.') => env
            .get_template(&format!("{name}.html"))
            .with_context(|| format!("模板 {name} 不存在")),
        Err(e) => Err(e).with_context(|| format!("加载模板 {name} 失败")),
    }
}

impl TemplateRenderer for MiniJinjaRenderer {
    fn render(&self, template: &str, context: &TemplateContext) -> Result<String> {
        let env = self.env(self.templates_dir(context.page.theme.as_ref()));
        let tmpl = find_template(&env, template)?;
        let html = tmpl
            .render(Value::from_serialize(context))
            .with_context(|| format!("渲染模板 {template} 失败"))?;
        Ok(html)
    }

    /// extends/include 可引用目录内任意模板，因此对整个模板目录取摘要
    fn source_digest(&self, _template: &str, theme: Option<&ThemeSelection>) -> Option<String> {
        let dir = self.templates_dir(theme);
        let mut files = Vec::new();
        collect_digests(&dir, &dir, &mut files);
        hash_collection(files)
    }
}

/// 递归收集 `相对路径=内容哈希`
fn collect_digests(base_dir: &Path, current_dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(current_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_digests(base_dir, &path, out);
            continue;
        }
        let Ok(rel) = path.strip_prefix(base_dir) else {
            continue;
        };
        match std::fs::read(&path) {
            Ok(bytes) => out.push(format!("{}={}", rel.to_string_lossy(), sha256_hex(&bytes))),
            Err(e) => tracing::warn!("读取模板 {} 失败：{e}", path.display()),
        }
    }
}

/// 注册依赖当前语言的模板函数，数据来自上下文中的 `helpers`
pub fn register_functions(env: &mut Environment) {
    env.add_function("url_for", fn_url_for);
    env.add_function("asset_url", fn_asset_url);
    env.add_function("alternate", fn_alternate);
}

fn helpers(state: &State) -> Result<Value, Error> {
    state
        .lookup("helpers")
        .filter(|v| !v.is_undefined())
        .ok_or_else(|| Error::new(ErrorKind::UndefinedError, "模板上下文缺少 helpers"))
}

fn helper_str(helpers: &Value, key: &str) -> Result<String, Error> {
    let value = helpers.get_attr(key)?;
    Ok(value.as_str().unwrap_or_default().to_owned())
}

fn fn_url_for(state: &State, route: String) -> Result<String, Error> {
    let helpers = helpers(state)?;
    Ok(output::public_url(
        &route,
        &helper_str(&helpers, "locale")?,
        &helper_str(&helpers, "default_locale")?,
    ))
}

fn fn_asset_url(state: &State, path: String) -> Result<String, Error> {
    let base = helper_str(&helpers(state)?, "asset_base")?;
    Ok(format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

/// 当前页面在指定语言下的 URL，该语言没有对应版本时返回空串
fn fn_alternate(state: &State, locale: String) -> Result<String, Error> {
    let alternates = helpers(state)?.get_attr("alternates")?;
    let url = alternates.get_attr(&locale)?;
    Ok(url.as_str().unwrap_or_default().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Fixture;

    #[test]
    fn renders_with_locale_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("themes/aurora/templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("page.html"),
            "<a href=\"{{ url_for('/company') }}\">{{ page.title }}</a>\
             <link href=\"{{ asset_url('css/main.css') }}\">\
             <a hreflang=\"en\" href=\"{{ alternate('en') }}\">[{{ alternate('fr') }}]",
        )
        .unwrap();

        let fx = Fixture::new();
        let ctx = fx.context();
        let record = ctx.pages.iter().find(|r| r.locale.code == "es").unwrap();
        let context = TemplateContext::compose(&ctx, record);

        let renderer = MiniJinjaRenderer::new(dir.path());
        let html = renderer.render("page", &context).unwrap();
        assert_eq!(
            html,
            "<a href=\"/es/company/\">Inicio</a>\
             <link href=\"/assets/aurora/css/main.css\">\
             <a hreflang=\"en\" href=\"/\">[]"
        );
    }

    #[test]
    fn source_digest_tracks_every_template_file() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(templates.join("partials")).unwrap();
        std::fs::write(templates.join("page.html"), "{% include 'partials/nav.html' %}").unwrap();
        std::fs::write(templates.join("partials/nav.html"), "<nav></nav>").unwrap();

        let renderer = MiniJinjaRenderer::new(dir.path());
        let first = renderer.source_digest("page", None).unwrap();
        assert_eq!(renderer.source_digest("page", None).unwrap(), first);

        std::fs::write(templates.join("partials/nav.html"), "<nav>new</nav>").unwrap();
        assert_ne!(renderer.source_digest("page", None).unwrap(), first);

        // 主题模板目录与根模板目录分开计算
        assert!(renderer.source_digest("page", Some(&select_aurora())).is_none());
    }

    fn select_aurora() -> ThemeSelection {
        crate::theme::manifest::select_variant(&Fixture::new().theme, None)
    }

    #[test]
    fn missing_template_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new();
        let ctx = fx.context();
        let context = TemplateContext::compose(&ctx, &ctx.pages[0]);
        let err = MiniJinjaRenderer::new(dir.path())
            .render("nope", &context)
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
