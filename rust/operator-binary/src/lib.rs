pub mod admission;
pub mod api;
pub mod controller;
pub mod mirror;
pub mod request;
pub mod signer;
pub mod store;
pub mod utils;
pub mod workqueue;

#[cfg(test)]
mod test_fixtures;

pub const OPERATOR_NAME: &str = "certificates.stackable.tech";
