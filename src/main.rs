use domain::gateway::callback::CallbackDispatcher;
use entity_api::store::DbStore;
use events::EventPublisher;
use log::{error, info};
use relay::upstream::WsConnector;
use relay::validator::Validator;
use relay::{SessionContext, SessionManager, SessionTiming};
use service::tables::{AppTable, InstanceTable};
use service::{config::Config, logging::Logger};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to start logging: {e}");
        std::process::exit(1);
    }

    info!("Starting push relay...");

    let validator = match load_validator(&config) {
        Ok(validator) => validator,
        Err(e) => {
            error!("Failed to load app and instance tables: {e}");
            std::process::exit(1);
        }
    };

    let db = match service::init_database(&config).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to establish database connection: {e}");
            std::process::exit(1);
        }
    };

    let dispatcher = match CallbackDispatcher::new(&config) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("Failed to build callback client: {e}");
            std::process::exit(1);
        }
    };

    let manager = SessionManager::new(SessionContext {
        validator,
        connector: Arc::new(WsConnector),
        store: Arc::new(DbStore::new(db)),
        publisher: EventPublisher::new().with_handler(Arc::new(dispatcher)),
        timing: SessionTiming::from(&config),
    });

    match domain::registration::restore(&manager).await {
        Ok(count) => info!("Restored {count} sessions"),
        Err(e) => error!("Failed to restore stored registrations: {e}"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }

    info!("Shutting down, keeping registrations for the next start...");
    manager.shutdown().await;
}

fn load_validator(config: &Config) -> Result<Validator, service::tables::LoadError> {
    let apps = AppTable::load(config.apps_file())?;
    let instances = InstanceTable::load(config.instances_file())?;
    Ok(Validator::new(apps, instances))
}
