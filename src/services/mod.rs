pub mod codec;
pub mod ledger;
pub mod orchestrator;
pub mod orientation;
pub mod planner;
