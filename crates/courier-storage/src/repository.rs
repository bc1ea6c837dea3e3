//! Repository layer for data access

pub mod campaigns;
pub mod clients;
pub mod locks;
pub mod messages;
pub mod profiles;
pub mod settings;
pub mod templates;

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use std::sync::Arc;

// Re-export repository traits
pub use campaigns::CampaignRepository;
pub use clients::ClientRepository;
pub use locks::LockRepository;
pub use messages::{MessageRepository, SentQuery};
pub use profiles::ProfileRepository;
pub use settings::SettingsRepository;
pub use templates::TemplateRepository;

// Re-export concrete repository implementations
pub use campaigns::DbCampaignRepository;
pub use clients::DbClientRepository;
pub use locks::DbLockRepository;
pub use messages::DbMessageRepository;
pub use profiles::DbProfileRepository;
pub use settings::DbSettingsRepository;
pub use templates::DbTemplateRepository;

/// All repositories used by the dispatch engine
#[derive(Clone)]
pub struct Stores {
    pub campaigns: Arc<dyn CampaignRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub clients: Arc<dyn ClientRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub profiles: Arc<dyn ProfileRepository>,
    pub locks: Arc<dyn LockRepository>,
    pub templates: Arc<dyn TemplateRepository>,
}

impl Stores {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
            clients: Arc::new(DbClientRepository::new(pool.clone())),
            settings: Arc::new(DbSettingsRepository::new(pool.clone())),
            profiles: Arc::new(DbProfileRepository::new(pool.clone())),
            locks: Arc::new(DbLockRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool)),
        }
    }

    /// Repositories over a single in-memory store
    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            campaigns: store.clone(),
            messages: store.clone(),
            clients: store.clone(),
            settings: store.clone(),
            profiles: store.clone(),
            locks: store.clone(),
            templates: store,
        }
    }
}
