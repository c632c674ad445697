//! # queuelink
//!
//! Command-line front end: inspect an app's API, run a job, stream a job's
//! events, or duplicate a hub space.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::debug;

use queuelink_client::{
    Blob, Client, ClientOptions, DuplicateOptions, EventKind, InputValue, JobEvent, JobRef,
    JobRequest, Listener,
};
use queuelink_core::logging::{init_json_subscriber, init_subscriber};
use queuelink_settings::get_settings;

/// Client for queued remote job services.
#[derive(Parser, Debug)]
#[command(name = "queuelink", version, about = "Client for queued remote job services")]
struct Cli {
    /// Access token for private apps and hub operations.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log level (overrides settings).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the app's API description as JSON.
    Info {
        /// App URL, host, or hub space id.
        app: String,
    },
    /// Run a job and print its output.
    Predict {
        /// App URL, host, or hub space id.
        app: String,
        #[command(flatten)]
        job: JobArgs,
    },
    /// Run a job and print every event as a JSON line.
    Submit {
        /// App URL, host, or hub space id.
        app: String,
        #[command(flatten)]
        job: JobArgs,
    },
    /// Duplicate a hub space into your namespace.
    Duplicate {
        /// Hub space id (`owner/name`).
        app: String,
        /// Hardware tier for the copy.
        #[arg(long)]
        hardware: Option<String>,
        /// Make the copy private.
        #[arg(long)]
        private: bool,
        /// Sleep timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(clap::Args, Debug)]
struct JobArgs {
    /// Endpoint name (`/predict`) or function index.
    endpoint: String,
    /// Inputs as a JSON array.
    #[arg(long, default_value = "[]")]
    data: String,
    /// Files appended to the inputs as uploads.
    #[arg(long = "file")]
    files: Vec<PathBuf>,
}

fn parse_endpoint(endpoint: &str) -> JobRef {
    endpoint
        .parse::<usize>()
        .map_or_else(|_| JobRef::from(endpoint), JobRef::from)
}

fn parse_inputs(args: &JobArgs) -> Result<Vec<InputValue>> {
    let data: Value = serde_json::from_str(&args.data).context("--data is not valid JSON")?;
    let Value::Array(items) = data else {
        bail!("--data must be a JSON array");
    };
    let mut inputs: Vec<InputValue> = items.into_iter().map(InputValue::from).collect();
    for path in &args.files {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        let mut blob = Blob::new(bytes);
        if let Some(name) = path.file_name() {
            blob = blob.with_name(name.to_string_lossy());
        }
        inputs.push(blob.into());
    }
    Ok(inputs)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = get_settings();
    let level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    if settings.logging.json {
        init_json_subscriber(level);
    } else {
        init_subscriber(level);
    }

    let mut options = ClientOptions::default();
    if let Some(token) = &cli.token {
        options = options.with_token(token.clone());
    }

    match cli.command {
        Command::Info { app } => {
            let client = Client::connect(&app, options).await?;
            let info = client.view_api().await?;
            print_json(info.as_ref())?;
        }
        Command::Predict { app, job } => {
            let inputs = parse_inputs(&job)?;
            let client = Client::connect(&app, options).await?;
            let output = client.predict(parse_endpoint(&job.endpoint), inputs).await?;
            print_json(&output)?;
        }
        Command::Submit { app, job } => {
            let inputs = parse_inputs(&job)?;
            let client = Client::connect(&app, options).await?;
            let handle = client.prepare(parse_endpoint(&job.endpoint), JobRequest::new(inputs))?;
            let printer: Listener = Arc::new(|event: &JobEvent| {
                if let Ok(line) = serde_json::to_string(event) {
                    println!("{line}");
                }
            });
            let _ = handle
                .on(EventKind::Status, &printer)
                .on(EventKind::Data, &printer)
                .on(EventKind::Log, &printer);
            handle.start();
            tokio::select! {
                () = handle.finished() => {}
                _ = tokio::signal::ctrl_c() => {
                    debug!("interrupted; cancelling job");
                    handle.cancel().await;
                }
            }
            handle.destroy();
        }
        Command::Duplicate {
            app,
            hardware,
            private,
            timeout,
        } => {
            if options.token.is_none() {
                bail!("duplicate needs --token");
            }
            let duplicate = DuplicateOptions {
                private,
                hardware,
                timeout_secs: timeout,
            };
            let client = Client::duplicate(&app, duplicate, options).await?;
            println!("{}", client.config().root);
        }
    }
    Ok(())
}
