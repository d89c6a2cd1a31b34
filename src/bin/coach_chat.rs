//! coach-chat - 命令行对话客户端
//!
//! 用法：`coach-chat [--session <id>] <message...>`
//!
//! 负责：
//! - 从本地状态库恢复会话
//! - 流式打印回复
//! - Ctrl-C 取消当前回复
//! - 退出前保存状态

use std::sync::Arc;

use anyhow::{bail, Result};
use coach_chat_core::{
    rehydrate_chat, save_chat, ChatController, ClientConfig, CoachClient, EventType, SendStatus,
    SqliteKvStore, StaticToken, StoreConfig, StoreEvent,
};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志（写 stderr，stdout 留给回复内容）
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("coach_chat_core=debug".parse()?))
        .init();

    let (session_id, text) = parse_args(std::env::args().skip(1).collect())?;

    let config = ClientConfig::from_env();
    tracing::info!("🚀 coach-chat v{} → {}", env!("CARGO_PKG_VERSION"), config.base_url);

    let kv = SqliteKvStore::connect(&config.state_db_path())?;
    let store = Arc::new(rehydrate_chat(&kv, StoreConfig::default())?);

    let tokens = Arc::new(StaticToken(std::env::var("COACH_ACCESS_TOKEN").ok()));
    let client = CoachClient::new(config, tokens)?;
    let controller = Arc::new(ChatController::new(store.clone(), client));

    // 按游标增量打印 token
    let (subscriber, mut rx) = store.subscribe(vec![EventType::Messages]);
    let printer = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let mut printed = 0usize;
            while let Some(event) = rx.recv().await {
                if !matches!(event, StoreEvent::MessagesChanged { .. }) {
                    continue;
                }
                let cursor = store.cursor();
                if !cursor.is_streaming {
                    continue;
                }
                if cursor.content.len() > printed {
                    let _ = stdout.write_all(cursor.content[printed..].as_bytes()).await;
                    let _ = stdout.flush().await;
                    printed = cursor.content.len();
                }
            }
            printed
        })
    };

    let canceller = {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("收到 Ctrl-C，取消回复");
                controller.cancel();
            }
        })
    };

    let outcome = controller.send_message(&text, session_id.as_deref()).await;
    canceller.abort();
    store.unsubscribe(subscriber);
    let printed = printer.await.unwrap_or(0);

    save_chat(&kv, &store)?;

    let outcome = outcome?;
    // 游标复位前未打印的尾部
    if let Some(message) = store.message(&outcome.session_id, &outcome.message_id) {
        if let Some(rest) = message.content.get(printed..) {
            print!("{}", rest);
        }
    }
    println!();
    match outcome.status {
        SendStatus::Completed => {
            tracing::info!("👋 session={}", outcome.session_id);
            Ok(())
        }
        SendStatus::Cancelled => {
            eprintln!("(cancelled)");
            Ok(())
        }
        SendStatus::Failed(message) => bail!(message),
    }
}

fn parse_args(args: Vec<String>) -> Result<(Option<String>, String)> {
    let mut session_id = None;
    let mut words = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--session" | "-s" => match iter.next() {
                Some(id) => session_id = Some(id),
                None => bail!("--session 需要参数"),
            },
            _ => words.push(arg),
        }
    }

    let text = words.join(" ");
    if text.trim().is_empty() {
        bail!("用法: coach-chat [--session <id>] <message...>");
    }
    Ok((session_id, text))
}
