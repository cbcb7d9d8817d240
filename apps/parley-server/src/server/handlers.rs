pub(crate) mod auth;
pub(crate) mod conversations;
pub(crate) mod permissions;

pub(crate) use auth::*;
pub(crate) use conversations::*;
pub(crate) use permissions::*;
