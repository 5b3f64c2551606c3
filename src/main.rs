//! kestrel - one-shot driver for the conversation core
//!
//! Sends a single prompt through the full pipeline and prints every
//! projected notification as a JSON line. Useful for poking at a live
//! agent CLI without a host application.

use async_trait::async_trait;
use kestrel::sync::SinkError;
use kestrel::{AgentCommand, ConversationService, Notification, StateSink, TurnOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Prints each notification batch as JSON lines on stdout
struct JsonLineSink;

#[async_trait]
impl StateSink for JsonLineSink {
    async fn apply(&self, batch: &[Notification]) -> Result<(), SinkError> {
        for note in batch {
            let line = serde_json::to_string(note).map_err(|e| SinkError(e.to_string()))?;
            println!("{line}");
        }
        Ok(())
    }
}

/// Second store: counts only, stands in for a host's mirrored state
#[derive(Default)]
struct CountingSink(std::sync::atomic::AtomicUsize);

#[async_trait]
impl StateSink for CountingSink {
    async fn apply(&self, batch: &[Notification]) -> Result<(), SinkError> {
        self.0
            .fetch_add(batch.len(), std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging goes to stderr so the notification stream stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kestrel=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(prompt) = args.next() else {
        eprintln!("usage: kestrel <prompt> [model]");
        std::process::exit(2);
    };
    let model = args.next();

    let program = std::env::var("KESTREL_AGENT").unwrap_or_else(|_| "claude".to_string());
    let idle_timeout = std::env::var("KESTREL_IDLE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(kestrel::supervisor::DEFAULT_IDLE_TIMEOUT, Duration::from_secs);

    let command = AgentCommand::new(program).with_idle_timeout(idle_timeout);
    let mirror = Arc::new(CountingSink::default());
    let service = ConversationService::new(command, Arc::new(JsonLineSink), mirror.clone());

    let options = TurnOptions {
        model,
        ..TurnOptions::default()
    };
    let outcome = service.send_message(&prompt, options).await?;

    tracing::info!(
        ?outcome,
        mirrored = mirror.0.load(std::sync::atomic::Ordering::Relaxed),
        "turn finished"
    );
    Ok(())
}
