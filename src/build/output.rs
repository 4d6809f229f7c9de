/// 页面输出文件名
pub const INDEX_FILE: &str = "index.html";

/// 计算页面在输出目录中的相对路径。
///
/// 默认语言（或空语言）不加前缀：`route/index.html`，根路由为 `index.html`；
/// 其它语言加前缀：`locale/route/index.html`，路由自身已以该语言开头时不重复添加。
/// 结果幂等，且 `.`、`..` 与空段都会被丢弃，不会逃出输出根目录。
pub fn map_path(route: &str, locale: &str, default_locale: &str) -> String {
    let mut parts = output_segments(route, locale, default_locale);
    parts.push(INDEX_FILE.to_owned());
    parts.join("/")
}

/// 页面的站内 URL，如 `/es/company/`，根页面为 `/`
pub fn public_url(route: &str, locale: &str, default_locale: &str) -> String {
    let parts = output_segments(route, locale, default_locale);
    if parts.is_empty() {
        return "/".to_owned();
    }
    format!("/{}/", parts.join("/"))
}

/// 语言目录前缀，默认语言为空串
pub fn locale_prefix(locale: &str, default_locale: &str) -> String {
    if is_default_locale(locale, default_locale) {
        return String::new();
    }
    segments(locale).join("/")
}

pub fn is_default_locale(locale: &str, default_locale: &str) -> bool {
    let locale = locale.trim();
    locale.is_empty() || locale.eq_ignore_ascii_case(default_locale.trim())
}

/// 拼接输出根目录下的相对路径，同样丢弃越界段
pub fn join_relative(base: &str, path: &str) -> String {
    segments(base)
        .into_iter()
        .chain(segments(path))
        .collect::<Vec<_>>()
        .join("/")
}

fn output_segments(route: &str, locale: &str, default_locale: &str) -> Vec<String> {
    let mut route = segments(route);
    if route
        .last()
        .is_some_and(|s| s.eq_ignore_ascii_case(INDEX_FILE))
    {
        route.pop();
    }

    if is_default_locale(locale, default_locale) {
        return route;
    }

    let prefix = segments(locale);
    let redundant = route.len() >= prefix.len()
        && route
            .iter()
            .zip(&prefix)
            .all(|(a, b)| a.eq_ignore_ascii_case(b));
    if redundant {
        route.drain(..prefix.len());
    }

    prefix.into_iter().chain(route).collect()
}

fn segments(path: &str) -> Vec<String> {
    path.trim()
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(str::to_owned)
        .collect()
}
