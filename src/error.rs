use thiserror::Error;
use ulid::Ulid;

/// 外部协作方（内容、语言、菜单、主题等服务）返回的错误
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("未找到：{0}")]
    NotFound(String),

    #[error("功能未启用：{0}")]
    FeatureDisabled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// “未找到”与“功能未启用”在构建中按缺失处理，而非失败
    pub fn is_absence(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::FeatureDisabled(_))
    }
}

/// 单个页面渲染失败，只影响该页面
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("页面 {page_id}（{locale}）未关联模板")]
    TemplateMissing { page_id: Ulid, locale: String },

    #[error("模板 {template_id} 既没有路径也没有 slug")]
    TemplateIdentifierMissing { template_id: Ulid },

    #[error("渲染模板 {template} 失败：{source}")]
    Renderer {
        template: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("构建已取消")]
    Cancelled,
}

/// 存储后端写入错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("输出路径越界：{0}")]
    OutsideRoot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BuildError {
    /// 缺少必需的协作方等配置问题，开始工作前即失败
    #[error("构建配置错误：{0}")]
    Config(String),

    #[error("未知语言：{0}")]
    UnknownLocale(String),

    #[error("页面 {page_id} 的父页面 {parent_id} 无法解析")]
    UnresolvedParent { page_id: Ulid, parent_id: Ulid },

    #[error("{what}：{source}")]
    Service {
        what: String,
        #[source]
        source: ServiceError,
    },

    #[error("页面 {page_id}（{locale}，{route}）渲染失败：{source}")]
    Render {
        page_id: Ulid,
        locale: String,
        route: String,
        #[source]
        source: RenderError,
    },

    #[error("写入 {path} 失败：{source}")]
    Write {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("主题资源 {theme}/{asset} 处理失败：{source}")]
    Asset {
        theme: String,
        asset: String,
        #[source]
        source: ServiceError,
    },

    #[error("构建已取消")]
    Cancelled,

    /// 多个页面级错误合并后的结果
    #[error("构建完成但有 {count} 个错误：\n{summary}")]
    Joined { count: usize, summary: String },
}

impl BuildError {
    pub fn service(what: impl Into<String>, source: ServiceError) -> Self {
        Self::Service {
            what: what.into(),
            source,
        }
    }

    /// 将页面级错误合并为单个错误，空列表返回 None
    pub fn join(errors: &[BuildError]) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let summary = errors
            .iter()
            .map(|e| format!("  - {e}"))
            .collect::<Vec<_>>()
            .join("\n");
        Some(Self::Joined {
            count: errors.len(),
            summary,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Render {
                    source: RenderError::Cancelled,
                    ..
                }
        )
    }
}
