//! jobbroker entry point: loads a broker definition and runs its queues until shutdown.

use std::time::Duration;

use jobbroker_common::AppConfig;
use jobbroker_queue::{Broker, BrokerBuilder, BrokerEvent, QueueState, Registry, load_with};
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long stopping queues may take before the process exits anyway.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

/// Logs every broker event and starts each queue once it is ready.
async fn follow_events(broker: Broker, mut events: broadcast::Receiver<BrokerEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Event logger fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            BrokerEvent::QueueReady { queue, .. } => {
                info!(queue = %queue.info().label(), "Queue ready, starting it");
                let queue = queue.clone();
                tokio::spawn(async move { queue.start().await });
            }
            BrokerEvent::BrokerInitialized => info!("All queues ready"),
            BrokerEvent::BrokerStarted => info!(queues = broker.queues().len(), "Broker started"),
            BrokerEvent::BrokerStopped => info!("Broker stopped"),
            BrokerEvent::WorkError { meta, message } => warn!(
                worker = meta.worker.number,
                module = %meta.worker.module,
                id = ?message.id,
                error = ?meta.error,
                "Work failed"
            ),
            BrokerEvent::QueuePoison { meta, message } => warn!(
                queue = %meta.queue.info().label(),
                id = ?message.id,
                dequeue_count = message.dequeue_count,
                "Poison message removed"
            ),
            other => debug!(event = other.name(), "Broker event"),
        }
    }
}

/// Waits for `BrokerStopped`, giving up after [`STOP_GRACE`].
async fn wait_stopped(mut events: broadcast::Receiver<BrokerEvent>) {
    let stopped = async {
        loop {
            match events.recv().await {
                Ok(BrokerEvent::BrokerStopped) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    };
    if tokio::time::timeout(STOP_GRACE, stopped).await.is_err() {
        warn!("Queues did not stop in time");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobbroker=debug,jobbroker_queue=debug".into()),
        )
        .init();

    info!("Starting jobbroker...");

    let config = AppConfig::load()?;
    let Some(path) = std::env::args().nth(1).or_else(|| config.broker_config.clone()) else {
        error!("No broker definition given; pass a path or set JOBBROKER_BROKER_CONFIG");
        return Err("missing broker definition path".into());
    };

    let builder = BrokerBuilder::with_event_capacity(config.event_capacity);
    let events = builder.subscribe();
    let broker = match load_with(&path, &Registry::new(), builder) {
        Ok(broker) => broker,
        Err(e) => {
            e.trace();
            return Err(e.into());
        }
    };

    tokio::spawn(follow_events(broker.clone(), events));
    broker.connect();

    shutdown_signal().await;

    let running = broker
        .queues()
        .iter()
        .any(|queue| queue.state() == QueueState::Started);
    let stopped = broker.subscribe();
    broker.stop();
    if running {
        wait_stopped(stopped).await;
    }

    info!("Shutdown complete");
    Ok(())
}
