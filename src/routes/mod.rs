pub mod auth;
pub mod billing;
pub mod health;
pub mod memberships;
pub mod organizations;
pub mod packages;
pub mod roles;
pub mod users;
