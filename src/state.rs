use std::sync::Arc;
use std::time::Duration;

use crate::clients::vsphere::VsphereConnector;
use crate::config::Config;
use crate::db::Store;
use crate::platform::Platform;
use crate::services::{
    AuthService, PlatformService, SeaOrmAuthService, SeaOrmUserService, TokenIssuer, UserService,
};
use crate::session::{Clock, SessionRegistry, SystemClock};

#[derive(Clone)]
pub struct SharedState {
    pub config: Arc<Config>,

    pub store: Store,

    pub sessions: Arc<SessionRegistry>,

    pub auth_service: Arc<dyn AuthService>,

    pub user_service: Arc<dyn UserService>,

    pub platform_service: Arc<PlatformService>,
}

impl SharedState {
    /// Production wiring: vCenter REST client and the system clock.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let platform = Arc::new(VsphereConnector::new(
            Duration::from_secs(config.platform.request_timeout_seconds),
            &config.platform.vim_release,
        ));
        Self::with_platform(config, platform, Arc::new(SystemClock)).await
    }

    /// Wires every service around an explicit platform and clock.
    pub async fn with_platform(
        config: Config,
        platform: Arc<dyn Platform>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = Store::with_pool_options(
            &config.general.database_path,
            config.general.max_db_connections,
            config.general.min_db_connections,
        )
        .await?;

        store
            .bootstrap_admin(&config.bootstrap, &config.security)
            .await?;

        let sessions = Arc::new(SessionRegistry::new(
            platform,
            clock,
            chrono::Duration::hours(config.auth.session_ttl_hours),
        ));

        let tokens = Arc::new(TokenIssuer::new(
            &config.auth.jwt_secret,
            chrono::Duration::hours(config.auth.token_ttl_hours),
        ));

        let auth_service: Arc<dyn AuthService> =
            Arc::new(SeaOrmAuthService::new(store.clone(), tokens));
        let user_service: Arc<dyn UserService> = Arc::new(SeaOrmUserService::new(
            store.clone(),
            config.security.clone(),
        ));
        let platform_service = Arc::new(PlatformService::new(
            sessions.clone(),
            config.platform.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            sessions,
            auth_service,
            user_service,
            platform_service,
        })
    }
}
