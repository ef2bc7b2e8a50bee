pub mod identity;
pub mod session;
pub mod tenants;
