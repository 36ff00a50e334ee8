pub mod tokens;
pub use tokens::{Claims, TokenIssuer};

pub mod auth_service;
pub mod auth_service_impl;
pub use auth_service::{AuthError, AuthService, LoginResult, Principal};
pub use auth_service_impl::SeaOrmAuthService;

pub mod user_service;
pub mod user_service_impl;
pub use user_service::{NewUser, UserError, UserService};
pub use user_service_impl::SeaOrmUserService;

pub mod platform_service;
pub use platform_service::{
    ConnectInput, PlatformService, PowerOutcome, ProxyError, SnapshotCreated, VmView,
};
