pub mod cloud;
pub mod config;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod missions;
pub mod purchases;
pub mod retry;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use cloud::CloudStore;
use config::DaemonConfig;
use events::{EventBroadcaster, EventDispatcher};
use identity::IdentityProvider;
use ledger::Ledger;
use missions::MissionBook;
use purchases::{BroadcastPlatform, ProductCatalog, PurchasePlatform, PurchaseProcessor};
use storage::Storage;

/// Shared application state: every service, explicitly constructed with its
/// storage/identity collaborators injected so tests can substitute fakes.
pub struct AppContext {
    pub config: DaemonConfig,
    pub storage: Arc<Storage>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub identity: Arc<IdentityProvider>,
    pub ledger: Arc<Ledger>,
    pub missions: Arc<MissionBook>,
    pub purchases: Arc<PurchaseProcessor>,
}

impl AppContext {
    /// Standard wiring: purchase transactions are finished by notifying the
    /// host app over the broadcaster.
    pub async fn init(config: DaemonConfig, cloud: Arc<dyn CloudStore>) -> Result<Self> {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let platform: Arc<dyn PurchasePlatform> =
            Arc::new(BroadcastPlatform::new(broadcaster.clone()));
        Self::init_inner(config, cloud, platform, broadcaster).await
    }

    /// Wiring with an explicit purchase platform — used by tests.
    pub async fn init_with_platform(
        config: DaemonConfig,
        cloud: Arc<dyn CloudStore>,
        platform: Arc<dyn PurchasePlatform>,
    ) -> Result<Self> {
        let broadcaster = Arc::new(EventBroadcaster::new());
        Self::init_inner(config, cloud, platform, broadcaster).await
    }

    async fn init_inner(
        config: DaemonConfig,
        cloud: Arc<dyn CloudStore>,
        platform: Arc<dyn PurchasePlatform>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let identity = Arc::new(IdentityProvider::load(storage.clone()).await?);
        let ledger = Arc::new(Ledger::new(
            config.ledger.clone(),
            storage.clone(),
            cloud,
            identity.clone(),
            broadcaster.clone(),
        ));
        let missions = Arc::new(
            MissionBook::load(
                config.missions.clone(),
                storage.clone(),
                ledger.clone(),
                broadcaster.clone(),
            )
            .await?,
        );
        let catalog = ProductCatalog::from_config(&config.products);
        let purchases = Arc::new(PurchaseProcessor::new(
            ledger.clone(),
            storage.clone(),
            identity.clone(),
            catalog,
            platform,
            broadcaster.clone(),
        ));

        Ok(Self {
            config,
            storage,
            broadcaster,
            identity,
            ledger,
            missions,
            purchases,
        })
    }

    /// Build the single-consumer event dispatcher over this context.
    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher::new(
            self.config.clone(),
            self.ledger.clone(),
            self.missions.clone(),
            self.purchases.clone(),
            self.identity.clone(),
            self.broadcaster.clone(),
        ))
    }
}
