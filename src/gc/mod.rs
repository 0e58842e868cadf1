//! Background maintenance: a single worker draining a min-heap of
//! scheduled tasks (row collect, cell-cache trim, RID-list rebuild).

pub mod dispatcher;

pub use dispatcher::{Dispatcher, Task};
