//! 本地存储查看工具
//!
//! 打开某个会话用户的本地数据库，以 JSON 输出会话、消息、待发送项、未读数和用户资料。
//! 不连接服务器。

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use im_sdk_core::{ConversationKey, ConversationType, SeqCursor, StoreConfig, StoreContext};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::info;

/// 本地存储查看工具
#[derive(Parser, Debug)]
#[command(name = "im-store-cli")]
#[command(about = "查看 IM 本地存储（会话、消息、待发送、资料）", long_about = None)]
struct Args {
    /// 数据根目录
    #[arg(long)]
    data_dir: PathBuf,

    /// 会话用户 ID
    #[arg(long)]
    session_user: i64,

    /// 进程标识
    #[arg(long, default_value = "main")]
    process_tag: String,

    /// 日志级别（默认: warn,im_sdk_core=info）
    #[arg(long, default_value = "warn,im_sdk_core=info")]
    log_level: String,

    /// 额外把日志写入文件
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Single,
    System,
}

impl From<Kind> for ConversationType {
    fn from(k: Kind) -> Self {
        match k {
            Kind::Single => ConversationType::Single,
            Kind::System => ConversationType::System,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 会话列表（按 seq 倒序）
    Conversations {
        #[arg(long, default_value = "20")]
        limit: u32,
        /// 游标 seq，0 表示从最新处开始
        #[arg(long, default_value = "0")]
        before_seq: i64,
        /// 游标 local_id（取上一页输出的 nextCursor），0 表示只按 seq
        #[arg(long, default_value = "0")]
        before_local_id: i64,
        #[arg(long, value_enum)]
        kind: Option<Kind>,
        #[arg(long)]
        include_deleted: bool,
    },
    /// 某个会话的消息（按 seq 倒序）
    Messages {
        #[arg(long)]
        target: i64,
        #[arg(long, value_enum, default_value = "single")]
        kind: Kind,
        #[arg(long, default_value = "20")]
        limit: u32,
        #[arg(long, default_value = "0")]
        before_seq: i64,
        #[arg(long, default_value = "0")]
        before_local_id: i64,
    },
    /// 全部待发送项
    Pending,
    /// 总未读数
    Unread,
    /// 缓存的用户资料
    User {
        #[arg(long)]
        uid: i64,
    },
}

/// 初始化日志：stderr 为主，可选同时写文件
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // stdout 留给 JSON 输出
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(true);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("无法创建日志文件 {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn cursor(before_seq: i64, before_local_id: i64) -> SeqCursor {
    if before_local_id > 0 {
        SeqCursor::new(before_seq, before_local_id)
    } else {
        SeqCursor::before_seq(before_seq)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level, args.log_file.as_ref())?;

    let config = StoreConfig::new(&args.data_dir).with_process_tag(args.process_tag.clone());
    info!(
        "[CLI] 打开存储: dir={}, session={}",
        config.session_dir(args.session_user).display(),
        args.session_user
    );
    let ctx = StoreContext::new(config);
    let session = args.session_user;

    let result = run(&ctx, session, args.command).await;
    ctx.close_all().await;
    result
}

async fn run(ctx: &StoreContext, session: i64, command: Command) -> Result<()> {
    match command {
        Command::Conversations {
            limit,
            before_seq,
            before_local_id,
            kind,
            include_deleted,
        } => {
            let page = ctx
                .conversations()
                .page_query(
                    session,
                    kind.map(Into::into),
                    cursor(before_seq, before_local_id),
                    limit,
                    include_deleted,
                )
                .await
                .context("查询会话失败")?;
            print_json(&page)
        }
        Command::Messages {
            target,
            kind,
            limit,
            before_seq,
            before_local_id,
        } => {
            let key = ConversationKey::new(kind.into(), target);
            let page = ctx
                .messages()
                .page_query(session, key, cursor(before_seq, before_local_id), limit)
                .await
                .context("查询消息失败")?;
            print_json(&page)
        }
        Command::Pending => {
            let pending = ctx
                .sending()
                .resume_pending(session)
                .await
                .context("查询待发送项失败")?;
            print_json(&pending)
        }
        Command::Unread => {
            let total = ctx
                .conversations()
                .get_all_unread_count(session)
                .await
                .context("查询未读数失败")?;
            print_json(&serde_json::json!({ "unread": total }))
        }
        Command::User { uid } => {
            let info = ctx
                .users()
                .get_by_user_id(session, uid)
                .await
                .context("查询用户资料失败")?;
            print_json(&info)
        }
    }
}
