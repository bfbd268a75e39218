//! Command handlers, kept out of main.rs so they can be tested

pub mod inspect;
pub mod instrument;

pub use inspect::execute_inspect;
pub use instrument::{apply_overrides, execute_instrument, InstrumentSummary, ModuleStatus, ModuleSummary};
