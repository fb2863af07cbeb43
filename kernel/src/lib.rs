// Regent Kernel
//
// Policy definition indexing and registry state reconciliation.

pub mod cache;
pub mod model;
pub mod save;
pub mod state;
pub mod store;
