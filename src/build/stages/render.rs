//! 并发渲染。
//!
//! 工作单元是一个语言的全部页面：同一语言内保持页面顺序，不同语言并行。
//! 单个页面失败（包括渲染器 panic）只记录诊断与错误，不影响其它页面。

use crossbeam_channel as channel;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use ulid::Ulid;

use crate::build::cancel::CancelToken;
use crate::build::context::{BuildContext, TemplateContext};
use crate::build::fingerprint::sha256_hex;
use crate::error::{BuildError, RenderError};
use crate::service::TemplateRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderStatus {
    Rendered,
    Failed,
    Cancelled,
}

/// 每个尝试渲染的页面都有一条诊断，成功与失败都记录
#[derive(Debug, Clone, Serialize)]
pub struct RenderDiagnostic {
    pub page_id: Ulid,
    pub locale: String,
    pub route: String,
    pub template: Option<String>,
    pub duration: Duration,
    pub status: RenderStatus,
    pub error: Option<String>,
}

/// 渲染成功的页面，`index` 指向 `BuildContext::pages`
#[derive(Debug, Clone)]
pub struct RenderedHtml {
    pub index: usize,
    pub html: String,
    pub checksum: String,
    pub output_path: String,
}

#[derive(Debug, Default)]
pub struct RenderReport {
    /// 按记录顺序排列
    pub rendered: Vec<RenderedHtml>,
    /// 按完成顺序排列
    pub diagnostics: Vec<RenderDiagnostic>,
    /// 按记录顺序排列
    pub errors: Vec<BuildError>,
    pub cancelled: bool,
}

impl RenderReport {
    pub fn succeeded(&self) -> usize {
        self.rendered.len()
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }
}

#[derive(Default)]
struct Collector {
    rendered: Vec<RenderedHtml>,
    diagnostics: Vec<RenderDiagnostic>,
    errors: Vec<(usize, BuildError)>,
    cancelled: bool,
}

/// 实际使用的工作线程数：0 取可用并行度，且不超过参与构建的语言数
pub fn effective_workers(configured: usize, distinct_locales: usize) -> usize {
    let workers = if configured == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        configured
    };
    workers.min(distinct_locales).max(1)
}

pub struct RenderPipeline<'a> {
    ctx: &'a BuildContext,
    renderer: &'a dyn TemplateRenderer,
    cancel: &'a CancelToken,
    /// 配置的线程数，0 表示可用并行度
    configured: usize,
}

impl<'a> RenderPipeline<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        renderer: &'a dyn TemplateRenderer,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            ctx,
            renderer,
            cancel,
            configured: ctx.options.workers,
        }
    }

    /// 渲染 `indices` 时实际使用的线程数，按其中出现的语言数收紧
    pub fn workers_for(&self, indices: &[usize]) -> usize {
        let locales: HashSet<&str> = indices
            .iter()
            .map(|&i| self.ctx.pages[i].locale.code.as_str())
            .collect();
        effective_workers(self.configured, locales.len())
    }

    /// 渲染 `indices` 指定的记录
    pub fn run(&self, indices: &[usize]) -> RenderReport {
        let collector = Mutex::new(Collector::default());
        let workers = self.workers_for(indices);

        if workers <= 1 || indices.len() <= 1 {
            tracing::debug!("顺序渲染 {} 个页面", indices.len());
            for &index in indices {
                self.render_one(index, &collector);
            }
        } else {
            let groups = self.group_by_locale(indices);
            tracing::debug!(
                "使用 {} 个工作线程渲染 {} 个语言分组",
                workers,
                groups.len()
            );
            let (tx, rx) = channel::bounded::<Vec<usize>>(workers);

            std::thread::scope(|scope| {
                for _ in 0..workers {
                    let rx = rx.clone();
                    let collector = &collector;
                    scope.spawn(move || {
                        for group in rx.iter() {
                            for index in group {
                                self.render_one(index, collector);
                            }
                        }
                    });
                }
                drop(rx);

                for group in groups {
                    if tx.send(group).is_err() {
                        break;
                    }
                }
                drop(tx);
            });
        }

        let mut collected = collector.into_inner();
        collected.rendered.sort_by_key(|r| r.index);
        collected.errors.sort_by_key(|(index, _)| *index);
        RenderReport {
            rendered: collected.rendered,
            diagnostics: collected.diagnostics,
            errors: collected.errors.into_iter().map(|(_, e)| e).collect(),
            cancelled: collected.cancelled,
        }
    }

    /// 按语言首次出现的顺序分组，组内保持记录顺序
    fn group_by_locale(&self, indices: &[usize]) -> Vec<Vec<usize>> {
        let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
        for &index in indices {
            let code = self.ctx.pages[index].locale.code.as_str();
            match groups.iter_mut().find(|(c, _)| *c == code) {
                Some((_, group)) => group.push(index),
                None => groups.push((code, vec![index])),
            }
        }
        groups.into_iter().map(|(_, group)| group).collect()
    }

    fn render_one(&self, index: usize, collector: &Mutex<Collector>) {
        let record = &self.ctx.pages[index];
        let template = record
            .template
            .as_ref()
            .and_then(|t| t.identifier())
            .map(str::to_owned);

        let started = Instant::now();
        let result = self.attempt(index);
        let duration = started.elapsed();

        let mut diagnostic = RenderDiagnostic {
            page_id: record.page.id,
            locale: record.locale.code.clone(),
            route: record.route().to_owned(),
            template,
            duration,
            status: RenderStatus::Rendered,
            error: None,
        };

        match result {
            Ok(html) => {
                let rendered = RenderedHtml {
                    index,
                    checksum: sha256_hex(html.as_bytes()),
                    output_path: self.ctx.output_path(record),
                    html,
                };
                let mut collector = collector.lock();
                collector.diagnostics.push(diagnostic);
                collector.rendered.push(rendered);
            }
            Err(source) => {
                let cancelled = matches!(source, RenderError::Cancelled);
                diagnostic.status = if cancelled {
                    RenderStatus::Cancelled
                } else {
                    tracing::error!(
                        "页面 {}（{}）渲染失败：{source}",
                        record.route(),
                        record.locale.code
                    );
                    RenderStatus::Failed
                };
                diagnostic.error = Some(source.to_string());

                let error = BuildError::Render {
                    page_id: record.page.id,
                    locale: record.locale.code.clone(),
                    route: record.route().to_owned(),
                    source,
                };
                let mut collector = collector.lock();
                collector.cancelled |= cancelled;
                collector.diagnostics.push(diagnostic);
                collector.errors.push((index, error));
            }
        }
    }

    fn attempt(&self, index: usize) -> Result<String, RenderError> {
        let record = &self.ctx.pages[index];
        if self.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        let template = record
            .template
            .as_ref()
            .ok_or_else(|| RenderError::TemplateMissing {
                page_id: record.page.id,
                locale: record.locale.code.clone(),
            })?;
        let name = template
            .identifier()
            .ok_or(RenderError::TemplateIdentifierMissing {
                template_id: template.id,
            })?;

        let context = TemplateContext::compose(self.ctx, record);
        let html = panic::catch_unwind(AssertUnwindSafe(|| self.renderer.render(name, &context)))
            .unwrap_or_else(|payload| Err(anyhow::anyhow!("渲染器 panic：{}", panic_message(&*payload))))
            .map_err(|source| RenderError::Renderer {
                template: name.to_owned(),
                source,
            })?;

        // 渲染期间收到取消信号时丢弃结果
        if self.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        Ok(html)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("未知错误")
}
