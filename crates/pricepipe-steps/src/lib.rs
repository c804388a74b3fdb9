pub mod check;
pub mod cleaning;
pub mod context;
pub mod download;
pub mod split;
pub mod train;

pub use context::StepContext;
