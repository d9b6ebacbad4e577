//! hostscope CLI
//!
//! Runs single questions from the terminal and inspects the conversation
//! store, sandbox policy and metrics of a deployment.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;

use hostscope::config::DEFAULT_CONFIG_PATH;
use hostscope::store::call_blocking;
use hostscope::tracing::{init_tracing, shutdown_tracing};
use hostscope::{metrics, AppConfig, ConversationStore, Engine, Inbound, Reply, Responder, Sandbox};

#[derive(Parser, Debug)]
#[command(name = "hostscope")]
#[command(about = "Chat-operated server diagnostics", version)]
struct Args {
    /// Configuration file (missing file → defaults)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask one question and print the answer
    Ask {
        question: String,
        /// Thread to continue (same thread + channel keeps history)
        #[arg(long, default_value = "cli")]
        thread: String,
        #[arg(long, default_value = "cli")]
        channel: String,
        /// Defaults to $USER
        #[arg(long)]
        user: Option<String>,
    },
    /// List recent sessions
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        user: Option<String>,
    },
    /// Show one session's history and tool calls
    Session {
        thread: String,
        #[arg(long, default_value = "cli")]
        channel: String,
        /// Tool calls to show, newest first
        #[arg(long, default_value_t = 20)]
        tools: usize,
    },
    /// Aggregate activity over a trailing window
    Stats {
        #[arg(long, default_value_t = 24)]
        hours: u64,
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// Remove expired conversations now
    Sweep,
    /// Check a command line against the sandbox policy without running it
    Check {
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print Prometheus metrics
    Metrics,
}

/// Prints progress to stderr and the answer to stdout
struct ConsoleResponder {
    json: bool,
}

#[async_trait]
impl Responder for ConsoleResponder {
    async fn acknowledge(&self, inbound: &Inbound) {
        tracing::debug!(thread = %inbound.thread_key, "Question received");
    }

    async fn placeholder(&self, _inbound: &Inbound) {
        if !self.json {
            eprintln!("Looking into it...");
        }
    }

    async fn render(&self, _inbound: &Inbound, reply: Reply) {
        if self.json {
            print_json(&reply);
            return;
        }
        if reply.is_error {
            eprintln!("Error: {}", reply.text);
            return;
        }
        println!("{}", reply.text);
        let meta = &reply.metadata;
        let tokens = if meta.usage_reported {
            format!("{} in / {} out", meta.usage.input_tokens, meta.usage.output_tokens)
        } else {
            "not reported".to_string()
        };
        eprintln!(
            "\n[{} tool calls, {} rounds, tokens: {}]",
            meta.tool_calls, meta.iterations, tokens
        );
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_tracing(&config.logging).map_err(|e| anyhow::anyhow!(e))?;

    let result = run(args, &config).await;
    shutdown_tracing(&config.logging);
    result
}

async fn run(args: Args, config: &AppConfig) -> Result<()> {
    match args.command {
        Commands::Ask {
            question,
            thread,
            channel,
            user,
        } => {
            let engine = Arc::new(Engine::from_config(config)?);
            let user_id = user
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "cli".to_string());
            let user = engine.user_config(&user_id);
            let responder = Arc::new(ConsoleResponder { json: args.json });
            engine
                .dispatch(Inbound::new(thread, channel, user_id, question), user, responder)
                .await
                .await
                .context("turn task failed")?;
        }

        Commands::Sessions { limit, user } => {
            let store = Arc::new(ConversationStore::open(config.store.clone())?);
            let sessions =
                call_blocking(store, move |s| s.list_recent_sessions(limit, user.as_deref())).await?;
            if args.json {
                print_json(&sessions);
            } else if sessions.is_empty() {
                println!("No sessions.");
            } else {
                for s in sessions {
                    println!(
                        "{:<6} {:<24} {:<12} {:<12} {:>4} msgs {:>4} tools {:>8} tokens  {}{}",
                        s.conversation_id,
                        s.thread_key,
                        s.channel,
                        s.user_id,
                        s.message_count,
                        s.tool_call_count,
                        s.usage.total(),
                        format_ms(s.updated_at),
                        if s.active { "  (active)" } else { "" },
                    );
                }
            }
        }

        Commands::Session {
            thread,
            channel,
            tools,
        } => {
            let store = Arc::new(ConversationStore::open(config.store.clone())?);
            let lookup = (thread.clone(), channel.clone());
            let detail =
                call_blocking(store, move |s| s.session_detail(&lookup.0, &lookup.1, tools)).await?;
            let Some(detail) = detail else {
                bail!("no session for thread '{}' in channel '{}'", thread, channel);
            };
            if args.json {
                print_json(&detail);
                return Ok(());
            }
            let s = &detail.summary;
            println!(
                "Session {} ({} / {}) user {}, started {}, {} tokens",
                s.conversation_id,
                s.thread_key,
                s.channel,
                s.user_id,
                format_ms(s.created_at),
                s.usage.total()
            );
            println!("\n── Messages ──");
            for m in &detail.messages {
                println!("[{}] {}: {}", format_ms(m.created_at), m.role.as_str(), m.content);
            }
            println!("\n── Tool calls ──");
            for t in &detail.tool_calls {
                let duration = t.duration_ms.map(|d| format!("{}ms", d)).unwrap_or_else(|| "?".into());
                println!(
                    "[{}] {} {} {} ({})",
                    format_ms(t.timestamp_ms),
                    if t.success { "ok " } else { "ERR" },
                    t.tool_name,
                    t.input,
                    duration
                );
            }
        }

        Commands::Stats { hours, top } => {
            let store = Arc::new(ConversationStore::open(config.store.clone())?);
            let stats = call_blocking(store, move |s| s.aggregate_stats(hours, top)).await?;
            if args.json {
                print_json(&stats);
                return Ok(());
            }
            println!("Last {}h:", stats.window_hours);
            println!("  sessions     {}", stats.sessions);
            println!("  messages     {}", stats.messages);
            println!(
                "  tool calls   {} ({} failed, {:.1}%)",
                stats.tool_calls,
                stats.failed_tool_calls,
                stats.failure_rate * 100.0
            );
            println!(
                "  tokens       {} in / {} out",
                stats.usage.input_tokens, stats.usage.output_tokens
            );
            for tool in &stats.top_tools {
                let avg = tool
                    .avg_duration_ms
                    .map(|d| format!("{:.0}ms avg", d))
                    .unwrap_or_default();
                println!(
                    "    {:<20} {:>5} calls {:>4} failed  {}",
                    tool.tool_name, tool.calls, tool.failures, avg
                );
            }
        }

        Commands::Sweep => {
            let store = Arc::new(ConversationStore::open(config.store.clone())?);
            let swept = call_blocking(store, |s| s.sweep_expired()).await?;
            println!("Removed {} expired conversation(s)", swept);
        }

        Commands::Check { program, args: argv } => {
            let sandbox = Sandbox::new(config.sandbox.clone());
            match sandbox.check(&program, &argv) {
                Ok(validated) => println!("allowed: {} {}", validated.program, validated.args.join(" ")),
                Err(violation) => bail!(violation),
            }
        }

        Commands::Metrics => {
            print!("{}", metrics::encode_text());
        }
    }
    Ok(())
}
