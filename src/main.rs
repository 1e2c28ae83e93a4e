//! Siren - 急救调度智能体
//!
//! 入口：初始化日志与配置，创建编排组件，并在标准输入上运行单会话 REPL。
//! 命令：`/state` 查看会话状态，`/abort` 中止会话，`/quit` 退出。

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use siren::agent::{create_agent_components, process_message, InboundMessage};
use siren::config::load_config_or_default;
use siren::observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config_or_default(std::env::args().nth(1).map(Into::into));
    let components = create_agent_components(&cfg);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session_id: Option<String> = None;

    stdout
        .write_all(b"siren ready. Describe the emergency (/state, /abort, /quit).\n> ")
        .await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        let out = match line {
            "" => String::new(),
            "/quit" => break,
            "/state" => match session_id.as_deref() {
                Some(id) => match components.sessions.summary(id).await {
                    Ok(s) => serde_json::to_string_pretty(&s)?,
                    Err(e) => format!("error: {}", e),
                },
                None => "no session yet".to_string(),
            },
            "/abort" => match session_id.as_deref() {
                Some(id) => match components.sessions.abort(id).await {
                    Ok(s) => format!("[{}] session aborted", s.stage),
                    Err(e) => format!("error: {}", e),
                },
                None => "no session yet".to_string(),
            },
            text => {
                let msg = InboundMessage::new(session_id.as_deref(), text);
                match process_message(&components, msg).await {
                    Ok(reply) => {
                        session_id = Some(reply.session_id.clone());
                        format!("[{}] {}", reply.stage, reply.assistant_text)
                    }
                    Err(e) => format!("error ({}): {}", e.kind(), e),
                }
            }
        };
        if !out.is_empty() {
            stdout.write_all(out.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }
    Ok(())
}
