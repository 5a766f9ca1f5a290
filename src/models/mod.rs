pub mod task;

pub use task::{Task, LAST_MODIFIED_FORMAT};
