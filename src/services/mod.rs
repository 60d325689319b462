pub mod grid_store;
#[cfg(test)]
pub mod memory_store;
pub mod retrieval_service;
