//! Purpose: `cartsync` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document (or JSON lines for `count --watch`) on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Guest cart mutations go through `api::Tab` (lock + atomic replace + notify).
#![allow(clippy::result_large_err)]

use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod origin_paths;

use cartsync::api::{Error, ErrorKind, to_exit_code};
use origin_paths::{
    OriginNameResolveError, default_origin_dir, default_origin_root, resolve_named_origin,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    init_tracing();

    let origin_dir = resolve_origin_dir(cli.dir, cli.origin.as_deref())?;
    command_dispatch::dispatch_command(cli.command, origin_dir)
        .map_err(add_corrupt_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "cartsync",
    version,
    about = "Keep the cart badge count in sync across tabs, logins, and flaky networks",
    long_about = None,
    after_help = r#"EXAMPLES
  $ cartsync cart add sku-123 --quantity 2
  $ cartsync count --watch              # Terminal 1: follows the badge count
  $ cartsync cart remove sku-123        # Terminal 2: terminal 1 prints the new count
  $ cartsync count --endpoint https://shop.example/api/cart --user u1 --token "$TOKEN"

Set RUST_LOG=debug to see every guest cart signal on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        env = "CARTSYNC_DIR",
        help = "Origin directory holding guest_cart.json (default: ~/.cartsync/origins/default)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(long, help = "Named origin under ~/.cartsync/origins (overrides --dir)")]
    origin: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(subcommand, about = "Inspect or edit the guest cart")]
    Cart(CartCommand),
    #[command(about = "Print the cart count a header badge would show")]
    Count(CountArgs),
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CartCommand {
    #[command(about = "Print the guest cart")]
    Show,
    #[command(about = "Add a quantity of a product")]
    Add {
        product: String,
        #[arg(long, short = 'q', default_value_t = 1)]
        quantity: u32,
    },
    #[command(about = "Set a product's quantity (0 removes it)")]
    Set { product: String, quantity: u32 },
    #[command(about = "Remove a product")]
    Remove { product: String },
    #[command(about = "Empty the guest cart")]
    Clear,
}

#[derive(Args)]
struct CountArgs {
    #[arg(
        long,
        env = "CARTSYNC_ENDPOINT",
        help = "Cart endpoint URL used when signed in",
        value_hint = ValueHint::Url
    )]
    endpoint: Option<String>,
    #[arg(
        long,
        env = "CARTSYNC_TOKEN",
        hide_env_values = true,
        help = "Access token; requires --user"
    )]
    token: Option<String>,
    #[arg(long, env = "CARTSYNC_USER", help = "User id; requires --token")]
    user: Option<String>,
    #[arg(long, help = "Keep running and print every count change until Ctrl-C")]
    watch: bool,
    #[arg(long, default_value_t = 2000, help = "Guest cart polling period")]
    poll_interval_ms: u64,
    #[arg(long, default_value_t = 10_000, help = "Cart request timeout")]
    timeout_ms: u64,
}

fn resolve_origin_dir(dir: Option<PathBuf>, origin: Option<&str>) -> Result<PathBuf, Error> {
    let Some(name) = origin else {
        return Ok(dir.unwrap_or_else(default_origin_dir));
    };
    resolve_named_origin(name, &default_origin_root()).map_err(|err| {
        let message = match err {
            OriginNameResolveError::Empty => "origin name is empty",
            OriginNameResolveError::ContainsPathSeparator => {
                "origin name must not contain path separators"
            }
        };
        Error::new(ErrorKind::Usage)
            .with_message(message)
            .with_hint("Use --dir for an explicit directory.")
    })
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn emit_json(value: Value) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(status) = err.status() {
        inner.insert("status".to_string(), json!(status));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(status) = err.status() {
        lines.push(format!("status: {status}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("The guest cart is unreadable. Run `cartsync cart clear` to reset it.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `cartsync --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "cartsync") else {
        return "Try `cartsync --help`.".to_string();
    };
    let mut parts = Vec::new();
    for token in tokens.iter().skip(pos + 1) {
        if token.starts_with('-') || token.starts_with('<') || token.starts_with('[') {
            break;
        }
        parts.push(*token);
    }
    if parts.is_empty() {
        "Try `cartsync --help`.".to_string()
    } else {
        format!("Try `cartsync {} --help`.", parts.join(" "))
    }
}
