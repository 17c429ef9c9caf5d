mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use console_sdk::ConsoleClient;
use sync_core::push::PushConnector;
use sync_core::socket::WsConnector;
use sync_core::{metrics, SessionBinder, SessionDeps, SessionEvent, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::cli::{Cli, DEFAULT_LOG_FILTER};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let config = SyncConfig::from_env();
    let calendar = match cli.push_url.as_deref() {
        Some(url) => Some(Arc::new(
            WsConnector::new(url).with_context(|| format!("invalid push url {url}"))?,
        ) as Arc<dyn PushConnector>),
        None => None,
    };
    let deps = SessionDeps {
        backend: Arc::new(ConsoleClient::new(cli.base_url.clone(), cli.token.clone())),
        calendar,
        principal: cli.principal(),
    };

    info!(
        base_url = %cli.base_url,
        push_url = %cli.push_url.as_deref().unwrap_or("unset"),
        principal = %deps.principal,
        poll_hold_secs = config.poll_hold.as_secs(),
        poll_retry_ms = config.poll_retry_backoff.as_millis() as u64,
        calendar_push = config.calendar_push,
        "starting console-sync"
    );

    let mut session = SessionBinder::new(deps, config);
    session.open_messenger().await;
    info!(threads = session.threads().len(), "thread list ready");
    if let Some(thread_id) = cli.thread {
        session.select_thread(Some(thread_id)).await;
        info!(thread_id, messages = session.messages(thread_id).len(), "thread open");
    }
    if cli.calendar && !session.show_calendar() {
        warn!("calendar requested but live updates are unavailable");
    }

    loop {
        tokio::select! {
            event = session.next_event() => report(&session, event),
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    info!("shutting down");
    session.shutdown().await;
    if cli.metrics {
        print!("{}", String::from_utf8_lossy(&metrics::gather()));
    }
    Ok(())
}

/// Logs go to stderr so `--metrics` output on stdout stays parseable.
fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!("invalid log filter {filter:?} ({err}); using {DEFAULT_LOG_FILTER}");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });
    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn report(session: &SessionBinder, event: SessionEvent) {
    match event {
        SessionEvent::ThreadsChanged => {
            let unread: u32 = session.threads().iter().map(|t| t.unread_count).sum();
            info!(threads = session.threads().len(), unread, "threads updated");
        }
        SessionEvent::MessagesChanged { thread_id } => {
            let messages = session.messages(thread_id);
            let preview = messages
                .last()
                .and_then(|m| m.body.as_deref())
                .unwrap_or("");
            info!(thread_id, messages = messages.len(), preview, "messages updated");
        }
        SessionEvent::CalendarChanged { slot_id } => {
            let present = session.slots().contains_key(&slot_id);
            info!(slot_id, present, "calendar slot changed");
        }
        SessionEvent::ReadReceipt { thread_id, ok } => {
            info!(thread_id, ok, "read receipt settled");
        }
    }
}
