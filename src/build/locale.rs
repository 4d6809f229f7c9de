use serde::Serialize;
use ulid::Ulid;

use crate::error::BuildError;
use crate::service::LocaleService;

/// 一次构建中使用的语言
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LocaleSpec {
    pub code: String,
    pub id: Ulid,
    pub is_default: bool,
}

/// 解析后的语言集合，`ordered` 中若含默认语言则必在首位
#[derive(Debug, Clone)]
pub struct ResolvedLocales {
    pub default: LocaleSpec,
    pub ordered: Vec<LocaleSpec>,
}

impl ResolvedLocales {
    pub fn codes(&self) -> Vec<String> {
        self.ordered.iter().map(|l| l.code.clone()).collect()
    }
}

/// 解析构建语言。
///
/// 未显式请求时使用配置列表，并保证默认语言恰好出现一次且位于首位；
/// 显式请求时按调用方顺序大小写不敏感去重，只有默认语言本就在列表中时才移到首位，
/// 不会强行插入。
pub fn resolve_locales(
    requested: &[String],
    configured: &[String],
    default_code: &str,
    lookup: &dyn LocaleService,
) -> Result<ResolvedLocales, BuildError> {
    let default_code = default_code.trim();
    let requested: Vec<&str> = non_empty(requested);
    let explicit = !requested.is_empty();

    let mut codes: Vec<&str> = Vec::new();
    if !explicit {
        codes.push(default_code);
    }
    let source = if explicit { requested } else { non_empty(configured) };
    for code in source {
        if !codes.iter().any(|c| c.eq_ignore_ascii_case(code)) {
            codes.push(code);
        }
    }

    if let Some(pos) = codes.iter().position(|c| c.eq_ignore_ascii_case(default_code))
        && pos > 0
    {
        let code = codes.remove(pos);
        codes.insert(0, code);
    }

    let mut ordered: Vec<LocaleSpec> = Vec::with_capacity(codes.len());
    for code in codes {
        let spec = lookup_spec(code, default_code, lookup)?;
        if ordered.iter().any(|l| l.id == spec.id) {
            tracing::debug!("语言 {code} 与已解析语言指向同一记录，忽略");
            continue;
        }
        ordered.push(spec);
    }

    let default = match ordered.iter().find(|l| l.is_default) {
        Some(spec) => spec.clone(),
        None => lookup_spec(default_code, default_code, lookup)?,
    };

    Ok(ResolvedLocales { default, ordered })
}

fn lookup_spec(
    code: &str,
    default_code: &str,
    lookup: &dyn LocaleService,
) -> Result<LocaleSpec, BuildError> {
    let locale = lookup.get_by_code(code).map_err(|e| {
        if e.is_absence() {
            BuildError::UnknownLocale(code.to_owned())
        } else {
            BuildError::service(format!("解析语言 {code} 失败"), e)
        }
    })?;
    Ok(LocaleSpec {
        is_default: locale.code.eq_ignore_ascii_case(default_code)
            || code.eq_ignore_ascii_case(default_code),
        code: locale.code,
        id: locale.id,
    })
}

fn non_empty(codes: &[String]) -> Vec<&str> {
    codes
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect()
}
