use crate::build::context::{BuildContext, PageRenderRecord};
use crate::build::locale::LocaleSpec;
use crate::build::output;
use crate::build::writer::{ArtifactCategory, ArtifactSink, WriteRequest};
use crate::config::SiteConfig;
use crate::error::BuildError;

pub const SITEMAP_FILE: &str = "sitemap.xml";
pub const ROBOTS_FILE: &str = "robots.txt";
pub const FEED_FILE: &str = "feed.xml";

/// 构建收尾：按各自开关写入 sitemap.xml、robots.txt 与各语言 feed.xml。
/// `entries` 为本次渲染成功或未变更跳过的记录。
pub fn finalize(
    ctx: &BuildContext,
    config: &SiteConfig,
    entries: &[&PageRenderRecord],
    sink: &ArtifactSink<'_>,
) -> Vec<BuildError> {
    let mut errors = Vec::new();
    let mut write = |path: String, body: String, category: ArtifactCategory, content_type: &str| {
        let request = WriteRequest::from_bytes(path, body.into_bytes(), category, content_type);
        if let Err(e) = sink.write(request) {
            errors.push(e);
        }
    };

    if ctx.options.sitemap {
        write(
            SITEMAP_FILE.to_owned(),
            sitemap(ctx, entries),
            ArtifactCategory::Sitemap,
            "application/xml",
        );
        tracing::info!("已生成 sitemap.xml，共 {} 个地址", entries.len());
    }

    if ctx.options.robots {
        write(
            ROBOTS_FILE.to_owned(),
            robots(ctx, config),
            ArtifactCategory::Robots,
            "text/plain; charset=utf-8",
        );
        tracing::info!("已生成 robots.txt");
    }

    if ctx.options.feeds {
        for locale in &ctx.locales {
            let items: Vec<&PageRenderRecord> = entries
                .iter()
                .copied()
                .filter(|r| r.locale.id == locale.id)
                .collect();
            if items.is_empty() {
                continue;
            }
            write(
                feed_path(locale, &ctx.default_locale),
                feed(ctx, locale, &items, config.feed.post_count),
                ArtifactCategory::Feed,
                "application/rss+xml",
            );
        }
        tracing::info!("已生成 RSS feed");
    }

    errors
}

pub fn sitemap(ctx: &BuildContext, entries: &[&PageRenderRecord]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\" xmlns:xhtml=\"http://www.w3.org/1999/xhtml\">\n");

    for record in entries {
        xml.push_str("  <url>\n");
        xml.push_str(&format!(
            "    <loc>{}</loc>\n",
            xml_escape(&absolute(ctx, &ctx.public_url(record)))
        ));
        xml.push_str(&format!(
            "    <lastmod>{}</lastmod>\n",
            record.metadata.last_modified.format("%Y-%m-%d")
        ));
        // 多语言页面附带各语言版本
        if record.alternates.len() > 1 {
            for (code, url) in &record.alternates {
                xml.push_str(&format!(
                    "    <xhtml:link rel=\"alternate\" hreflang=\"{}\" href=\"{}\" />\n",
                    xml_escape(code),
                    xml_escape(&absolute(ctx, url))
                ));
            }
        }
        xml.push_str("  </url>\n");
    }

    xml.push_str("</urlset>\n");
    xml
}

pub fn robots(ctx: &BuildContext, config: &SiteConfig) -> String {
    let mut txt = String::from("User-agent: *\n");
    let disallow: Vec<&str> = config
        .robots
        .disallow
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .collect();
    if disallow.is_empty() {
        txt.push_str("Allow: /\n");
    } else {
        for path in disallow {
            txt.push_str(&format!("Disallow: {path}\n"));
        }
    }
    if ctx.options.sitemap {
        txt.push_str(&format!("\nSitemap: {}\n", absolute(ctx, &format!("/{SITEMAP_FILE}"))));
    }
    txt
}

/// 单个语言的 RSS 2.0，按最后修改时间倒序，最多 `limit` 条
pub fn feed(
    ctx: &BuildContext,
    locale: &LocaleSpec,
    entries: &[&PageRenderRecord],
    limit: usize,
) -> String {
    let mut items = entries.to_vec();
    items.sort_by(|a, b| b.metadata.last_modified.cmp(&a.metadata.last_modified));
    items.truncate(limit);

    let home = absolute(ctx, &output::public_url("/", &locale.code, &ctx.default_locale.code));
    let self_link = absolute(ctx, &format!("/{}", feed_path(locale, &ctx.default_locale)));

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<rss version=\"2.0\" xmlns:atom=\"http://www.w3.org/2005/Atom\">\n");
    xml.push_str("  <channel>\n");
    xml.push_str(&format!("    <title>{}</title>\n", xml_escape(&ctx.site.title)));
    xml.push_str(&format!("    <link>{}</link>\n", xml_escape(&home)));
    xml.push_str(&format!(
        "    <description>{}</description>\n",
        xml_escape(&ctx.site.description)
    ));
    xml.push_str(&format!("    <language>{}</language>\n", xml_escape(&locale.code)));
    xml.push_str(&format!(
        "    <atom:link href=\"{}\" rel=\"self\" type=\"application/rss+xml\" />\n",
        xml_escape(&self_link)
    ));
    if let Some(latest) = items.first() {
        xml.push_str(&format!(
            "    <lastBuildDate>{}</lastBuildDate>\n",
            latest.metadata.last_modified.to_rfc2822()
        ));
    }

    for record in &items {
        let link = xml_escape(&absolute(ctx, &ctx.public_url(record)));
        xml.push_str("    <item>\n");
        xml.push_str(&format!(
            "      <title>{}</title>\n",
            xml_escape(&record.translation.title)
        ));
        xml.push_str(&format!("      <link>{link}</link>\n"));
        xml.push_str(&format!("      <guid isPermaLink=\"true\">{link}</guid>\n"));
        xml.push_str(&format!(
            "      <pubDate>{}</pubDate>\n",
            record.metadata.last_modified.to_rfc2822()
        ));
        let summary = record
            .translation
            .summary
            .as_ref()
            .or(record.content_translation.summary.as_ref());
        if let Some(summary) = summary {
            xml.push_str(&format!(
                "      <description>{}</description>\n",
                xml_escape(summary)
            ));
        }
        xml.push_str("    </item>\n");
    }

    xml.push_str("  </channel>\n</rss>\n");
    xml
}

pub fn feed_path(locale: &LocaleSpec, default_locale: &LocaleSpec) -> String {
    output::join_relative(
        &output::locale_prefix(&locale.code, &default_locale.code),
        FEED_FILE,
    )
}

fn absolute(ctx: &BuildContext, path: &str) -> String {
    format!("{}{}", ctx.site.url, path)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
