// src/main.rs

//! A small command-line client: sends one command and prints the reply, or
//! subscribes to channels and prints push messages until interrupted.

use anyhow::{Context, Result, anyhow};
use spineldb_client::config::Config;
use spineldb_client::connection::ConnectionInitializer;
use spineldb_client::core::protocol::{Command, ConnectionKind, RespFrame};
use spineldb_client::core::pubsub::{PushKind, PushMessage};
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

const USAGE: &str = "Usage: spineldb-client [--config path] [--url url] <command> [args...]
       spineldb-client [--config path] [--url url] --subscribe <channel>...
       spineldb-client [--config path] [--url url] --psubscribe <pattern>...";

/// What the invocation asks for.
enum Mode {
    Command(Vec<String>),
    Subscribe(PushKind, Vec<String>),
}

struct CliArgs {
    config_path: Option<String>,
    url: Option<String>,
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version") {
        println!("spineldb-client version {VERSION}");
        return Ok(());
    }
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        eprintln!("{USAGE}");
        std::process::exit(if args.is_empty() { 1 } else { 0 });
    }

    let cli = match parse_args(args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            std::process::exit(1);
        }
    };

    let mut config = match &cli.config_path {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e:#}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(url) = cli.url {
        config.url = url;
        config.validate().context("Invalid --url")?;
    }

    // Logs go to stderr so replies on stdout stay clean.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .compact()
        .with_ansi(true)
        .init();

    let initializer = ConnectionInitializer::new(config.connection_config()?)
        .context("Failed to prepare the connection")?;

    let result = match cli.mode {
        Mode::Command(words) => run_command(&initializer, words).await,
        Mode::Subscribe(kind, keys) => run_subscribe(&initializer, kind, keys).await,
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn parse_args(args: Vec<String>) -> Result<CliArgs> {
    let mut config_path = None;
    let mut url = None;
    let mut subscribe = None;
    let mut rest = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        // Flags are only recognised before the command itself.
        if !rest.is_empty() || subscribe.is_some() {
            rest.push(arg);
            continue;
        }
        match arg.as_str() {
            "--config" => {
                config_path = Some(iter.next().ok_or_else(|| anyhow!("--config flag requires a value"))?);
            }
            "--url" => {
                url = Some(iter.next().ok_or_else(|| anyhow!("--url flag requires a value"))?);
            }
            "--subscribe" => subscribe = Some(PushKind::Message),
            "--psubscribe" => subscribe = Some(PushKind::PMessage),
            _ => rest.push(arg),
        }
    }

    let mode = match subscribe {
        Some(_) if rest.is_empty() => {
            return Err(anyhow!("expected at least one channel or pattern"));
        }
        Some(kind) => Mode::Subscribe(kind, rest),
        None if rest.is_empty() => return Err(anyhow!("expected a command")),
        None => Mode::Command(rest),
    };
    Ok(CliArgs {
        config_path,
        url,
        mode,
    })
}

async fn run_command(initializer: &ConnectionInitializer, words: Vec<String>) -> Result<()> {
    let mut words = words.into_iter();
    let name = words.next().ok_or_else(|| anyhow!("expected a command"))?;
    let command = Command::new(name).args(words);

    let connection = initializer
        .connect(ConnectionKind::Plain)
        .await
        .with_context(|| format!("Could not connect to {}", initializer.config().address))?;
    debug!("Sending {:?}", command);
    let reply = connection.request(command).await?;
    connection.close();

    let mut out = String::new();
    render(&reply, 0, &mut out);
    print!("{out}");
    Ok(())
}

async fn run_subscribe(
    initializer: &ConnectionInitializer,
    kind: PushKind,
    keys: Vec<String>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PushMessage>();
    for key in &keys {
        let tx = tx.clone();
        initializer.dispatcher().add_listener(
            kind,
            key.clone(),
            Arc::new(move |msg| {
                let _ = tx.send(msg);
            }),
        );
    }

    let connection = initializer
        .connect(ConnectionKind::PubSub)
        .await
        .with_context(|| format!("Could not connect to {}", initializer.config().address))?;
    match kind {
        PushKind::Message => connection.subscribe(&keys).await?,
        PushKind::PMessage => connection.psubscribe(&keys).await?,
    };
    eprintln!("Listening on {} (Ctrl-C to quit)...", keys.join(", "));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                connection.close();
                return Ok(());
            }
            cause = connection.closed() => {
                return Err(anyhow!("connection lost: {cause}"));
            }
            Some(msg) = rx.recv() => {
                let channel = String::from_utf8_lossy(&msg.channel);
                let payload = String::from_utf8_lossy(&msg.payload);
                match &msg.pattern {
                    Some(pattern) => println!(
                        "{} {} {}",
                        String::from_utf8_lossy(pattern),
                        channel,
                        payload
                    ),
                    None => println!("{channel} {payload}"),
                }
            }
        }
    }
}

/// Renders a reply the way interactive Redis clients do.
fn render(frame: &RespFrame, indent: usize, out: &mut String) {
    match frame {
        RespFrame::SimpleString(s) => out.push_str(&format!("{s}\n")),
        RespFrame::Error(e) => out.push_str(&format!("(error) {e}\n")),
        RespFrame::Integer(i) => out.push_str(&format!("(integer) {i}\n")),
        RespFrame::BulkString(b) => {
            out.push_str(&format!("\"{}\"\n", String::from_utf8_lossy(b)));
        }
        RespFrame::Null | RespFrame::NullArray => out.push_str("(nil)\n"),
        RespFrame::Array(items) if items.is_empty() => out.push_str("(empty array)\n"),
        RespFrame::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(&" ".repeat(indent));
                }
                let prefix = format!("{}) ", i + 1);
                out.push_str(&prefix);
                render(item, indent + prefix.len(), out);
            }
        }
    }
}
