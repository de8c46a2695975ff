//! Process startup: tracing, configuration, and service wiring.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::channels::web::GatewayState;
use crate::config::Config;
use crate::error::Error;
use crate::history::HistoryStore;
use crate::jobs::Supervisor;
use crate::llm::ModelRegistry;
use crate::notify::PlatformNotifier;
use crate::store::{Keyspace, KvStore, MemoryStore};
use crate::stream::Multiplexer;
use crate::worker::WorkerPool;

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatrelay=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Fully wired gateway services, ready to serve.
pub struct Services {
    pub state: Arc<GatewayState>,
    pub supervisor: Arc<Supervisor>,
    pub pool: WorkerPool,
    pub config: Config,
}

/// Construct every service from configuration.
pub fn build_services(config: Config) -> Result<Services, Error> {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let keys = Keyspace::new(config.store.namespace.clone());
    let notifier = Arc::new(PlatformNotifier::new());

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        keys.clone(),
        Arc::clone(&notifier),
        config.stream.timeout,
        config.store.job_ttl,
    ));
    let history = Arc::new(HistoryStore::new(Arc::clone(&store), keys.clone()));
    let registry = Arc::new(ModelRegistry::builtin());
    let pool = WorkerPool::new(&config.worker)?;

    let multiplexer = Multiplexer::new(
        Arc::clone(&store),
        keys,
        Arc::clone(&supervisor),
        Arc::clone(&history),
        Arc::clone(&registry),
        Arc::new(pool.clone()),
        Arc::clone(&notifier),
        config.stream.clone(),
    );

    let state = Arc::new(GatewayState {
        supervisor: Arc::clone(&supervisor),
        multiplexer,
        history,
        registry,
        notifier,
        store,
    });

    Ok(Services {
        state,
        supervisor,
        pool,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn services_wire_up_from_defaults() {
        let config = Config::default();
        let services = build_services(config).unwrap();
        assert!(services.state.store.ping().await.is_ok());
        assert_eq!(services.pool.workers().await, services.pool.floor());
    }
}
