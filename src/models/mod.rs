pub mod billing;
pub mod membership;
pub mod organization;
pub mod package;
pub mod role;
pub mod user;
