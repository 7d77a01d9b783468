use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use lifeline::control;
use lifeline::db::Database;
use lifeline::http::{parse_method, Destination, RequestMode};
use lifeline::{CachingEngine, Config, HttpNetwork, Request};

#[derive(Parser, Debug)]
#[command(name = "lifeline")]
#[command(about = "Offline-resilience engine for crisis resources")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lifeline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install and activate this version, or resume it if already active
  Start,
  /// Send a request through the engine and print the response
  Fetch {
    /// Path or absolute URL
    target: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Extra header as `name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Send a control envelope, e.g. '{"type":"GET_VERSION"}'
  Message { envelope: String },
  /// Replay queued requests now that the network is back
  Sync,
  /// Print cache, queue and storage usage
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = lifeline::logging::init(&config.data_dir()?, args.verbose)?;

  let db = Database::open(&config.database_path()?)?;
  let network = Arc::new(HttpNetwork::new()?);
  let engine = CachingEngine::new(config, db, network);

  match args.command {
    Command::Start => {
      engine.start().await?;
      print_json(&serde_json::json!({
        "version": engine.version().as_str(),
        "state": engine.state(),
        "caches": engine.cache_status()?,
      }))?;
    }
    Command::Fetch {
      target,
      method,
      data,
      headers,
      navigate,
    } => {
      engine.start().await?;

      let mut request = Request::new(parse_method(&method)?, engine.resolve(&target)?);
      for header in &headers {
        if let Some((name, value)) = header.split_once(':') {
          request = request.with_header(name.trim(), value.trim());
        }
      }
      if let Some(body) = data {
        request = request.with_body(body);
      }
      if navigate {
        request = request
          .with_mode(RequestMode::Navigate)
          .with_destination(Destination::Document);
      }

      let response = engine.handle(request).await;
      println!("HTTP {}", response.status);
      for (name, value) in &response.headers {
        println!("{}: {}", name, value);
      }
      println!();
      println!("{}", response.text());
    }
    Command::Message { envelope } => {
      engine.start().await?;
      if let Some(reply) = control::dispatch_json(&engine, &envelope).await {
        println!("{}", reply);
      }
    }
    Command::Sync => {
      let report = engine.on_connectivity_restored().await?;
      print_json(&report)?;
    }
    Command::Status => {
      print_json(&serde_json::json!({
        "version": engine.version().as_str(),
        "storage": engine.storage_report()?,
        "queue": engine.queue().records()?,
      }))?;
    }
  }

  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
