use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use agentshell::utils::LoggingConfig;
use agentshell::{
    ChatRequest, Decision, InteractionKind, InteractionRequest, ProgressMode, ReplayBackend,
    RuntimeConfig, SessionHandle, SessionSummary, StreamRuntime, UiUpdate,
};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

#[derive(Parser)]
#[command(name = "agentshell", version, about = "AI shell streaming client", author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 向服务端提问并实时显示任务进度
    Chat {
        question: String,
        /// 使用的智能体，默认读取 AGENTSHELL_APP_ID
        #[arg(long)]
        app: Option<String>,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        llm: Option<String>,
    },
    /// 回放录制的 SSE 文本
    Replay {
        file: PathBuf,
        /// 拒绝所有确认与参数请求
        #[arg(long)]
        decline: bool,
    },
}

/// 交互请求的应答来源
enum Responder {
    Stdin(Lines<BufReader<Stdin>>),
    Auto { accept: bool },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();

    let cli = Cli::parse();
    let summary = match cli.command {
        Command::Chat {
            question,
            app,
            conversation,
            llm,
        } => handle_chat(question, app, conversation, llm).await?,
        Command::Replay { file, decline } => handle_replay(file, decline).await?,
    };

    println!();
    println!(
        "任务结束: {} ({:?})，输入 {} tokens，输出 {} tokens",
        summary.outcome.state,
        summary.outcome.cause,
        summary.usage.input_tokens,
        summary.usage.output_tokens
    );
    if !summary.outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(feature = "http-client")]
async fn handle_chat(
    question: String,
    app: Option<String>,
    conversation: Option<String>,
    llm: Option<String>,
) -> anyhow::Result<SessionSummary> {
    use agentshell::{AppRequest, BackendConfig};

    let backend_config = BackendConfig::from_env()?;
    let backend = agentshell::HermesHttpBackend::from_config(&backend_config)?;
    let runtime = StreamRuntime::new(Arc::new(backend)).with_config(RuntimeConfig::from_env()?);

    let request = ChatRequest::new(question)
        .with_language(backend_config.language.clone())
        .with_llm(llm.unwrap_or(backend_config.llm_id))
        .with_conversation(conversation.unwrap_or_default())
        .with_app(AppRequest::new(app.unwrap_or(backend_config.app_id)));

    let handle = runtime.start(request).await?;
    let stdin = BufReader::new(tokio::io::stdin()).lines();
    drive(handle, Responder::Stdin(stdin)).await
}

#[cfg(not(feature = "http-client"))]
async fn handle_chat(
    _question: String,
    _app: Option<String>,
    _conversation: Option<String>,
    _llm: Option<String>,
) -> anyhow::Result<SessionSummary> {
    Err(anyhow!("chat 需要启用 http-client 特性"))
}

async fn handle_replay(file: PathBuf, decline: bool) -> anyhow::Result<SessionSummary> {
    let backend = ReplayBackend::from_transcript_file(&file)
        .await
        .with_context(|| format!("加载回放文件 {} 失败", file.display()))?;
    let runtime = StreamRuntime::new(Arc::new(backend)).with_config(RuntimeConfig::from_env()?);
    let handle = runtime.start(ChatRequest::new("replay")).await?;
    drive(handle, Responder::Auto { accept: !decline }).await
}

async fn drive(mut handle: SessionHandle, mut responder: Responder) -> anyhow::Result<SessionSummary> {
    let mut updates = handle
        .subscribe()
        .ok_or_else(|| anyhow!("update feed already taken"))?;

    loop {
        let update = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n正在取消任务...");
                handle.cancel();
                continue;
            }
            update = updates.recv() => update,
        };
        let Some(update) = update else {
            break;
        };

        render(&update);
        match update {
            UiUpdate::Interaction(request) => {
                let decision = tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n正在取消任务...");
                        handle.cancel();
                        continue;
                    }
                    decision = decide(&request, &mut responder) => decision?,
                };
                if let Err(error) = handle.resolve(&request.task_id, &request.step_id, decision) {
                    eprintln!("提交决策失败: {error}");
                }
            }
            UiUpdate::Finished(_) => break,
            _ => {}
        }
    }

    Ok(handle.join().await?)
}

fn render(update: &UiUpdate) {
    match update {
        UiUpdate::Flow { to, .. } => println!("▶ 任务状态: {to}"),
        UiUpdate::Step(step) => {
            if let Some(progress) = &step.progress {
                let marker = match progress.mode {
                    ProgressMode::New => "",
                    ProgressMode::Replace => "  ↳ ",
                };
                println!("{marker}{}", progress.text);
            }
        }
        UiUpdate::Text { text, .. } => {
            print!("{text}");
            std::io::stdout().flush().ok();
        }
        UiUpdate::Document { document, .. } => {
            println!("\n📄 {} ({})", document.name, document.doc_type)
        }
        UiUpdate::Interaction(request) => match &request.kind {
            InteractionKind::Confirm { risk, reason } => {
                println!("\n⏸️ 工具 `{}` 请求执行 {}", request.step_name, risk.label());
                println!("💭 说明: {reason}");
            }
            InteractionKind::Parameters { message, schema } => {
                println!("\n📝 工具 `{}` 需要补全参数", request.step_name);
                println!("💭 说明: {message}");
                if !schema.is_null() {
                    println!("{schema:#}");
                }
            }
        },
        UiUpdate::Notice { message, .. } => eprintln!("⚠️ {message}"),
        UiUpdate::Finished(_) => {}
    }
}

async fn decide(request: &InteractionRequest, responder: &mut Responder) -> anyhow::Result<Decision> {
    match responder {
        Responder::Auto { accept } => Ok(match request.kind {
            InteractionKind::Confirm { .. } => Decision::Confirm(*accept),
            InteractionKind::Parameters { .. } if *accept => Decision::Parameters(Some(Map::new())),
            InteractionKind::Parameters { .. } => Decision::Parameters(None),
        }),
        Responder::Stdin(lines) => match request.kind {
            InteractionKind::Confirm { .. } => {
                prompt("是否执行? [y/N]: ");
                let answer = lines.next_line().await?.unwrap_or_default();
                let confirmed = matches!(answer.trim().to_lowercase().as_str(), "y" | "yes");
                Ok(Decision::Confirm(confirmed))
            }
            InteractionKind::Parameters { .. } => loop {
                prompt("请输入 JSON 参数（留空取消）: ");
                let Some(answer) = lines.next_line().await? else {
                    return Ok(Decision::Parameters(None));
                };
                let answer = answer.trim();
                if answer.is_empty() {
                    return Ok(Decision::Parameters(None));
                }
                match serde_json::from_str::<Value>(answer) {
                    Ok(Value::Object(params)) => return Ok(Decision::Parameters(Some(params))),
                    Ok(_) => eprintln!("参数必须是 JSON 对象"),
                    Err(error) => eprintln!("无法解析参数: {error}"),
                }
            },
        },
    }
}

fn prompt(text: &str) {
    print!("{text}");
    std::io::stdout().flush().ok();
}
