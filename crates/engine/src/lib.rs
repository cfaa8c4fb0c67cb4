pub mod audit;
pub mod cache;
pub mod decision;
pub mod router;
pub mod store;
