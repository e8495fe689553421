//! Typed task queues and the worker pools that drain them.

pub mod handler;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod tests;

pub use handler::{
    MockPollingClient, PollContext, PollError, PollRequest, PollingClient, TaskHandler,
    TaskHandlerRegistry,
};
pub use queue::{DispatchError, DispatchMessage, QueueName, QueueReceivers, TaskQueues};
pub use worker::{CompletionSink, WorkerDeps, WorkerPool};
