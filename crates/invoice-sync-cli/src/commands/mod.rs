pub mod audit;
pub mod create;
pub mod edit;
pub mod format;
pub mod list;
pub mod plan;
pub mod resolve;
pub mod stage;
pub mod status;
pub mod sync;
