use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cli_agent_bridge::callbacks::{CallbackError, PermissionResult, ToolPermissionContext};
use cli_agent_bridge::logging::{LogConfig, init_logging};
use cli_agent_bridge::protocol::{AssistantMessage, user_message_line};
use cli_agent_bridge::{
    ControlConfig, ControlProtocol, Message, SubprocessTransport, Transport, TransportConfig,
};

/// Run one prompt through the CLI and print the answer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Prompt to send
    prompt: String,

    /// Path to the CLI executable
    #[arg(long, value_name = "PATH")]
    cli_path: Option<PathBuf>,

    /// Model to request
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,

    /// Use print mode: no stdin, no control protocol
    #[arg(long)]
    one_shot: bool,

    /// Tool the session may use without asking; repeatable
    #[arg(long = "allow-tool", value_name = "NAME")]
    allow_tools: Vec<String>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides AGENT_BRIDGE_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<TransportConfig, cli_agent_bridge::config::ConfigError> {
    let mut builder = TransportConfig::builder()
        .stderr_callback(|line| debug!(target: "cli_stderr", "{}", line));

    if let Some(path) = &args.cli_path {
        builder = builder.cli_path(path);
    }
    if let Some(model) = &args.model {
        builder = builder.model(model);
    }
    if args.one_shot {
        builder = builder.one_shot(&args.prompt);
    }

    builder.build()
}

/// Allow listed tools, deny the rest
fn install_permission_policy(control: &ControlProtocol, allowed: Vec<String>) {
    let allowed: Arc<HashSet<String>> = Arc::new(allowed.into_iter().collect());

    control.permissions().set_callback(
        move |tool: String, _input: Value, _ctx: ToolPermissionContext| {
            let allowed = Arc::clone(&allowed);
            async move {
                if allowed.contains(&tool) {
                    info!("Allowing tool {}", tool);
                    Ok::<_, CallbackError>(PermissionResult::allow())
                } else {
                    info!("Denying tool {}", tool);
                    Ok(PermissionResult::deny(format!(
                        "Tool {tool} is not in the allow list"
                    )))
                }
            }
        },
    );
}

/// Print assistant text until the result arrives; returns the result's
/// error flag, or `None` if the stream ended first
async fn print_conversation(messages: &mut mpsc::Receiver<Message>) -> Option<bool> {
    while let Some(message) = messages.recv().await {
        match message {
            Message::Assistant(AssistantMessage { ref error, .. }) if error.is_some() => {
                warn!("Assistant error: {:?}", error);
            }
            Message::Assistant(assistant) => {
                let text = assistant.text();
                if !text.is_empty() {
                    println!("{text}");
                }
            }
            Message::Result(result) => {
                if let Some(text) = &result.result {
                    println!("{text}");
                }
                info!(
                    "Turn finished: {} turn(s), {} ms, cost {:?}",
                    result.num_turns, result.duration_ms, result.total_cost_usd
                );
                return Some(result.is_error);
            }
            other => debug!("Skipping {} message", other.message_type()),
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = build_config(&args)?;
    let interactive = config.mode.is_interactive();
    info!("Starting CLI session (interactive: {})", interactive);

    let mut transport = SubprocessTransport::new(config)?;
    let control = interactive.then(|| {
        let control = ControlProtocol::attach(&transport, ControlConfig::default());
        install_permission_policy(&control, args.allow_tools.clone());
        control
    });

    transport.connect().await?;
    info!("CLI started (pid: {:?})", transport.pid());

    let mut messages = transport
        .take_messages()
        .ok_or("message queue unavailable")?;
    if let Some(mut errors) = transport.take_errors() {
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                warn!("Transport error: {}", e);
            }
        });
    }

    if let Some(control) = &control {
        control.initialize().await?;
        transport
            .write(&user_message_line(&args.prompt, "default"))
            .await?;
    }

    let outcome = print_conversation(&mut messages).await;

    if let Some(control) = &control {
        control.close();
    }
    transport.close().await?;

    match outcome {
        Some(false) => Ok(()),
        Some(true) => {
            eprintln!("The session ended with an error result");
            std::process::exit(1);
        }
        None => {
            eprintln!("The CLI exited before producing a result");
            std::process::exit(1);
        }
    }
}
