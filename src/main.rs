use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use ulid::Ulid;

use cblog_static::build::{self, RunParams, cancel::CancelToken};
use cblog_static::config::SiteConfig;

#[derive(Parser)]
#[command(name = "cblog-static", about = "多语言静态站点构建引擎", version = long_version())]
struct Cli {
    /// 以 JSON 格式输出日志
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建静态站点
    Build {
        /// 项目根目录（默认当前目录）
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// 只构建指定语言，可重复或以逗号分隔
        #[arg(short, long = "locale", value_delimiter = ',')]
        locales: Vec<String>,

        /// 只构建指定页面 ID
        #[arg(short, long = "page", value_delimiter = ',')]
        pages: Vec<String>,

        /// 只渲染不写入
        #[arg(long)]
        dry_run: bool,

        /// 忽略增量缓存，全部重新渲染
        #[arg(long)]
        force: bool,

        /// 清除输出与缓存目录后全量重建
        #[arg(long)]
        clean: bool,

        /// 渲染线程数，0 表示使用可用并行度
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// 列出将要构建的页面与输出路径，不渲染
    Plan {
        /// 项目根目录（默认当前目录）
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        #[arg(short, long = "locale", value_delimiter = ',')]
        locales: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let root = match &cli.command {
        Commands::Build { root, .. } | Commands::Plan { root, .. } => root.clone(),
    };
    init_tracing(&root, cli.log_json);

    match cli.command {
        Commands::Build {
            root,
            locales,
            pages,
            dry_run,
            force,
            clean,
            workers,
        } => {
            let root = root.canonicalize()?;
            let site_config = SiteConfig::load(&root)?;
            let page_ids = pages
                .iter()
                .map(|id| {
                    Ulid::from_string(id.trim())
                        .map_err(|e| anyhow::anyhow!("无效的页面 ID {id}：{e}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let cancel = CancelToken::new();
            let handle = cancel.clone();
            ctrlc::set_handler(move || {
                tracing::warn!("收到中断信号，正在取消构建...");
                handle.cancel();
            })
            .context("注册中断处理失败")?;

            let result = build::run(
                &root,
                &site_config,
                RunParams {
                    clean,
                    force,
                    dry_run,
                    locales,
                    page_ids,
                    workers,
                },
                &cancel,
            )?;

            if result.dry_run {
                for diagnostic in &result.diagnostics {
                    tracing::info!(
                        "[预演] {} {} {:?} {}ms",
                        diagnostic.locale,
                        diagnostic.route,
                        diagnostic.status,
                        diagnostic.duration.as_millis()
                    );
                }
            }
        }
        Commands::Plan { root, locales } => {
            let root = root.canonicalize()?;
            let site_config = SiteConfig::load(&root)?;
            let entries = build::plan(&root, &site_config, locales)?;

            let changed = entries.iter().filter(|e| e.changed).count();
            for entry in &entries {
                println!(
                    "{} {:<6} {:<32} {}  {}",
                    if entry.changed { "*" } else { " " },
                    entry.locale,
                    entry.route,
                    entry.output_path,
                    entry.hash.get(..12).unwrap_or(&entry.hash),
                );
            }
            tracing::info!("共 {} 个页面，其中 {} 个需要重新渲染", entries.len(), changed);
        }
    }

    Ok(())
}

/// 默认日志级别取自站点配置，可被 RUST_LOG 覆盖
fn init_tracing(root: &Path, json: bool) {
    let default_level = SiteConfig::load(&root.canonicalize().unwrap_or_else(|_| root.to_path_buf()))
        .map(|c| c.server.log_level)
        .unwrap_or_else(|_| "info".to_owned());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

const fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        "\ncommit:  ",
        env!("CBLOG_STATIC_GIT_COMMIT"),
        "\nbuild:   ",
        env!("CBLOG_STATIC_BUILD_TIME"),
        "\ntarget:  ",
        env!("CBLOG_STATIC_BUILD_TARGET"),
        "\nprofile: ",
        env!("CBLOG_STATIC_BUILD_PROFILE"),
    )
}
