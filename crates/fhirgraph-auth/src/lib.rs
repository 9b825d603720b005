pub mod scopes;
pub mod token;

pub use scopes::{Permissions, ResourceScope, ResourceTarget, ScopeError, ScopeSet};
pub use token::{
    RefreshContext, RefreshOutcome, RefreshTokenCallback, SharedToken, TokenState,
    refresh_callback,
};
