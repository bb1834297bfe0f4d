// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use klaus_config::Config;
use klaus_core::{AgentEvent, AgentRunner, EventBus};
use klaus_model::{AnthropicProvider, ModelProvider};
use klaus_server::AppState;
use klaus_store::Store;
use klaus_tools::{builtin, ApprovalBroker, PatchGate, PatchOperation, PatchRequest, ToolDispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    match cli.command {
        Some(Commands::ShowConfig) => {
            print_config(&config);
            Ok(())
        }
        Some(Commands::Serve) | None => run_server(config).await,
    }
}

async fn run_server(mut config: Config) -> anyhow::Result<()> {
    // The workspace jail compares resolved paths, so the root itself must
    // be canonical before anything else sees it.
    std::fs::create_dir_all(&config.workspace_dir)
        .with_context(|| format!("cannot create workspace {}", config.workspace_dir.display()))?;
    config.workspace_dir = config
        .workspace_dir
        .canonicalize()
        .context("cannot canonicalize workspace dir")?;
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create database dir {}", parent.display()))?;
        }
    }
    let config = Arc::new(config);

    let store = Arc::new(Store::open(&config.db_path)?);
    let bus = Arc::new(EventBus::new());
    let broker = Arc::new(ApprovalBroker::new());

    let api_key = config.api_key.clone().unwrap_or_else(|| {
        warn!("no API key configured (KLAUS_API_KEY); model calls will fail");
        String::new()
    });
    let provider: Arc<dyn ModelProvider> = Arc::new(AnthropicProvider::new(api_key, None));

    let gate = config.require_patch_approval.then(|| {
        let emit_bus = Arc::clone(&bus);
        PatchGate {
            broker: Arc::clone(&broker),
            timeout: config.approval_timeout,
            emit: Arc::new(move |session_id: &str, request: &PatchRequest| {
                emit_bus.publish(
                    session_id,
                    AgentEvent::PatchApprovalRequired {
                        patch_id: request.patch_id.clone(),
                        file_path: request.file_path.clone(),
                        diff: request.diff.clone(),
                        operation: operation_label(request.operation).to_string(),
                    },
                );
            }),
        }
    });

    let registry = Arc::new(builtin::standard_registry(
        config.workspace_dir.clone(),
        Arc::clone(&store),
        gate,
    ));
    let dispatcher = Arc::new(ToolDispatcher::new(registry, Arc::clone(&store)));

    let runner = Arc::new(AgentRunner::new(
        Arc::clone(&config),
        store,
        Arc::clone(&provider),
        provider,
        dispatcher,
        bus,
    ));

    let state = AppState::new(runner, broker, config);
    klaus_server::serve(state).await
}

fn operation_label(operation: PatchOperation) -> &'static str {
    match operation {
        PatchOperation::Create => "create",
        PatchOperation::Modify => "modify",
        PatchOperation::Delete => "delete",
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn print_config(config: &Config) {
    let redact = |value: &Option<String>| if value.is_some() { "<set>" } else { "<unset>" };
    println!("api_key                  = {}", redact(&config.api_key));
    println!("api_secret               = {}", redact(&config.api_secret));
    println!("workspace_dir            = {}", config.workspace_dir.display());
    println!("db_path                  = {}", config.db_path.display());
    println!("model                    = {}", config.model);
    println!("max_tokens               = {}", config.max_tokens);
    println!("max_retries              = {}", config.max_retries);
    println!("max_context_messages     = {}", config.max_context_messages);
    println!("max_concurrent_sessions  = {}", config.max_concurrent_sessions);
    println!("max_prompt_chars         = {}", config.max_prompt_chars);
    println!("max_tool_calls           = {}", config.max_tool_calls);
    println!("max_tool_output_context  = {}", config.max_tool_output_context);
    println!("token_budget             = {}", config.token_budget);
    println!("cors_origin              = {}", config.cors_origin.as_deref().unwrap_or("* (dev)"));
    println!("ws_rate_limit            = {}/min", config.ws_rate_limit);
    println!("shutdown_timeout         = {:?}", config.shutdown_timeout);
    println!("session_ttl              = {:?}", config.session_ttl);
    println!("session_cleanup_interval = {:?}", config.session_cleanup_interval);
    println!("api_retry_count          = {}", config.api_retry_count);
    println!("api_retry_delay          = {:?}", config.api_retry_delay);
    println!("api_retry_max_delay      = {:?}", config.api_retry_max_delay);
    println!("approval_timeout         = {:?}", config.approval_timeout);
    println!("require_patch_approval   = {}", config.require_patch_approval);
    println!("metrics_enabled          = {}", config.metrics_enabled);
    println!("trust_proxy              = {}", config.trust_proxy);
    println!("port                     = {}", config.port);
}
