pub mod cache;
pub mod email;
pub mod tenant_settings;

pub use cache::CacheService;
pub use email::EmailService;
pub use tenant_settings::{PgTenantSettings, TenantSettingsProvider};
