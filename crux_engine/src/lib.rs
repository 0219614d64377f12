pub mod coalesce;
pub mod event_loop;
pub mod exec_queue;
pub mod executor;
pub mod gpu;
pub mod loaders;
pub mod message_bus;
pub mod node;
pub mod nodes;
pub mod ports;
pub mod resampler;
pub mod task_pool;
pub mod ui_pool;
pub mod worker;

mod tests_bridge;

// Re-exports
pub use executor::{ExecutionContext, Executor, ExecutorState, ProcessHandle};
pub use node::{NodeFactory, NodeInstance, ProcessNode, TickContext};
pub use task_pool::TaskPool;
pub use ui_pool::UiThreadPool;
