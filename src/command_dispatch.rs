//! Purpose: Hold top-level CLI command execution for `cartsync`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: `cart` commands print the resulting blob; `count` prints `{mode, cartCount}` lines.
//! Invariants: `count` owns a tokio runtime for its lifetime; `cart` commands stay synchronous.

use std::sync::Arc;
use std::time::Duration;

use cartsync::api::{
    CartCount, CartCountReconciler, FetchFuture, HttpCartSource, LocalCart, Origin, QueryOptions,
    ReadOutcome, ReconcilerDeps, ReconcilerOptions, ReconcilerSnapshot, RemoteCart,
    RemoteCartQuery, RemoteCartSource, Session, Tab,
};
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::debug;

use super::*;

pub(super) fn dispatch_command(command: Command, origin_dir: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Cart(command) => {
            let tab = Origin::watch_fs(origin_dir).open_tab();
            let cart = run_cart_command(command, &tab)?;
            emit_json(cart_json(&cart)?);
            Ok(RunOutcome::ok())
        }
        Command::Count(args) => run_count(args, origin_dir),
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "cartsync", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
    }
}

fn run_cart_command(command: CartCommand, tab: &Tab) -> Result<LocalCart, Error> {
    match command {
        CartCommand::Show => match tab.read_cart() {
            ReadOutcome::Missing => Ok(LocalCart::new()),
            ReadOutcome::Loaded(cart) => Ok(cart),
            ReadOutcome::Corrupt { reason } => Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("guest cart is unreadable: {reason}"))
                .with_path(tab.origin().store().path())),
        },
        CartCommand::Add { product, quantity } => {
            if quantity == 0 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--quantity must be at least 1")
                    .with_hint("Use `cartsync cart remove` to drop a product."));
            }
            tab.update_cart(|cart| cart.add(product, quantity))
        }
        CartCommand::Set { product, quantity } => {
            tab.update_cart(|cart| cart.set_quantity(product, quantity))
        }
        CartCommand::Remove { product } => {
            tab.update_cart_if(|cart| cart.remove(&product))?
                .ok_or_else(|| {
                    Error::new(ErrorKind::NotFound)
                        .with_message(format!("product not in guest cart: {product}"))
                        .with_hint("Use `cartsync cart show` to list products.")
                })
        }
        CartCommand::Clear => {
            tab.clear_cart()?;
            Ok(LocalCart::new())
        }
    }
}

fn cart_json(cart: &LocalCart) -> Result<Value, Error> {
    serde_json::to_value(cart).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode guest cart")
            .with_source(err)
    })
}

fn run_count(args: CountArgs, origin_dir: PathBuf) -> Result<RunOutcome, Error> {
    let session = session_from_args(&args)?;
    let source = cart_source(&args, &session)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start async runtime")
                .with_source(err)
        })?;
    runtime.block_on(count(args, origin_dir, session, source))
}

fn session_from_args(args: &CountArgs) -> Result<Session, Error> {
    match (args.token.as_deref(), args.user.as_deref()) {
        (None, None) => Ok(Session::guest()),
        (Some(token), Some(user)) if !token.is_empty() && !user.is_empty() => {
            Ok(Session::authenticated(token, user))
        }
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message("--token and --user must be given together")
            .with_hint("Omit both to read the guest cart.")),
    }
}

fn cart_source(args: &CountArgs, session: &Session) -> Result<Arc<dyn RemoteCartSource>, Error> {
    match args.endpoint.as_deref() {
        Some(endpoint) => {
            let source = HttpCartSource::new(endpoint)?
                .with_timeout(Duration::from_millis(args.timeout_ms));
            Ok(Arc::new(source))
        }
        None if session.is_authenticated() => Err(Error::new(ErrorKind::Usage)
            .with_message("signed-in count requires --endpoint")
            .with_hint("Pass --endpoint or set CARTSYNC_ENDPOINT.")),
        None => Ok(Arc::new(NoEndpoint)),
    }
}

/// Source for guest-only runs; the session never changes, so it is never asked.
struct NoEndpoint;

impl RemoteCartSource for NoEndpoint {
    fn fetch(&self, _access_token: &str) -> FetchFuture {
        Box::pin(async {
            Err::<RemoteCart, _>(
                Error::new(ErrorKind::Usage).with_message("no cart endpoint configured"),
            )
        })
    }
}

async fn count(
    args: CountArgs,
    origin_dir: PathBuf,
    session: Session,
    source: Arc<dyn RemoteCartSource>,
) -> Result<RunOutcome, Error> {
    let query = RemoteCartQuery::new(source, QueryOptions::new())?;
    let origin = Origin::watch_fs(origin_dir);
    let (_session_tx, session_rx) = watch::channel(session.clone());
    let reconciler = CartCountReconciler::spawn(ReconcilerDeps {
        tab: origin.open_tab(),
        session: session_rx,
        query: query.clone(),
        options: ReconcilerOptions::new()
            .with_poll_interval(Duration::from_millis(args.poll_interval_ms.max(1))),
    });

    let snapshot = reconciler.settled().await;
    if let Some(identity) = session.identity() {
        let state = query.state(identity.key());
        let failed_without_data = state
            .as_ref()
            .is_some_and(|state| state.data.is_none() && state.error.is_some());
        if failed_without_data {
            reconciler.shutdown().await;
            return Err(remote_failure(state.and_then(|state| state.error)));
        }
    }

    if !args.watch {
        emit_json(count_json(&snapshot, None));
        reconciler.shutdown().await;
        return Ok(RunOutcome::ok());
    }

    let mut updates = reconciler.subscribe_snapshot();
    let mut last = snapshot.count.clone();
    emit_json(count_json(&snapshot, timestamp_now()));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.count == last {
                    continue;
                }
                last = snapshot.count.clone();
                emit_json(count_json(&snapshot, timestamp_now()));
            }
        }
    }
    debug!("count watch stopped");
    reconciler.shutdown().await;
    Ok(RunOutcome::ok())
}

fn remote_failure(err: Option<Arc<Error>>) -> Error {
    let Some(err) = err else {
        return Error::new(ErrorKind::Internal).with_message("remote cart fetch failed");
    };
    let mut out = Error::new(err.kind())
        .with_message(err.message().unwrap_or("remote cart fetch failed").to_string());
    if let Some(status) = err.status() {
        out = out.with_status(status);
    }
    if let Some(hint) = err.hint() {
        out = out.with_hint(hint);
    }
    out
}

fn count_json(snapshot: &ReconcilerSnapshot, time: Option<String>) -> Value {
    let (mode, count) = match &snapshot.count {
        Some(count) => (count.mode_label(), count.value()),
        None => ("guest", 0),
    };
    let mut out = Map::new();
    if let Some(time) = time {
        out.insert("time".to_string(), json!(time));
    }
    out.insert("mode".to_string(), json!(mode));
    out.insert("cartCount".to_string(), json!(count));
    if let Some(CartCount::Authenticated { identity, .. }) = &snapshot.count {
        out.insert("user".to_string(), json!(identity.user_id()));
    }
    Value::Object(out)
}

fn timestamp_now() -> Option<String> {
    time::OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
