use std::{process, sync::OnceLock};

use bkpubsub::{config::Config, logger::LoggerManager, print_error};
use bkpubsub_amqp::{LapinDriver, LifecycleEvent, PubSubManager};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, info_span, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Logs lifecycle events until the manager's event channel closes.
async fn log_events(manager: PubSubManager<LapinDriver>) {
    let mut events = manager.subscribe_events();
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::Connected { attempt }) => {
                info!("Broker reachable after {} trial(s)", attempt);
            }
            Ok(LifecycleEvent::Close) => {
                warn!("Broker connection lost, reopening subscribe channel...");
                if let Err(e) = manager.get_subscribe_channel().await {
                    error!("Failed to reopen subscribe channel: {}", e);
                }
            }
            Ok(LifecycleEvent::Error(e)) => debug!("Connection reported: {}", e),
            Ok(LifecycleEvent::Attempt { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Lifecycle listener lagged, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting bkpubsub version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.connection);

    let exchange = cfg.connection.exchange_name.clone().unwrap_or_default();
    let manager = PubSubManager::builder(LapinDriver::default())
        .from_config(&cfg.connection)
        .log(info_span!("pubsub", exchange = %exchange))
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to create PubSubManager: {}", e);
            process::exit(1);
        });

    info!("Connecting to {}...", manager.url());
    let listener = tokio::spawn(log_events(manager.clone()));

    tokio::select! {
        result = manager.get_subscribe_channel() => match result {
            Ok(_) => info!("Subscribe channel ready on exchange '{}'", manager.exchange_name()),
            Err(e) => error!("Failed to open subscribe channel: {}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C before the broker was reachable");
            manager.shutdown();
            listener.abort();
            return Ok(());
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown...");
    manager.shutdown();
    listener.abort();
    info!("Shutdown complete");
    Ok(())
}
