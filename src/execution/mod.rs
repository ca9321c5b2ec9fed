// Order execution module
pub mod close_all;
pub mod executor;
pub mod ledger;
pub mod paper_broker;
pub mod router;
pub mod scheduler;

pub use close_all::{
    close_all_persisted, close_all_positions, CloseAllResult, ClosePositionResult, CloseStatus,
};
pub use executor::{CycleReport, ExecutionAction, ExecutionDecision, Executor, ExecutorSettings};
pub use ledger::{AccountState, PriceMap, SimulatedAccount, SimulatedPosition};
pub use paper_broker::{LocalPaperBroker, PaperOrder};
pub use router::{check_environment, generate_client_order_id, ExecutionRouter, RunMode};
pub use scheduler::{
    global_stop_signal, wait_until_next_boundary, Scheduler, SchedulerHandle, StopSignal, WaitOutcome,
};
