pub mod cache;
pub mod images;
pub mod keyring;
pub mod models;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;
