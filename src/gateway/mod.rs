//! Gateway server implementation

pub mod auth;
pub mod filter;
pub mod proxy;
mod response;
mod router;
mod server;

pub use auth::{AuthError, AuthManager, AuthScheme, CredentialTable, ResolvedIdentity, auth_middleware};
pub use filter::{FilterError, FilterGate, FilterManager, MatchTable, QueryParam, filter_middleware};
pub use proxy::{Forward, ForwardError, HttpForwarder};
pub use router::{AppState, create_admin_router, create_router};
pub use server::Gateway;
