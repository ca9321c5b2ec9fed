// Dual-channel (forming vs closed candle) signal module
pub mod engine;
pub mod ohlcv;
pub mod trackers;

pub use engine::{DualChannelEngine, ExecutionMode, ScanResult};
pub use ohlcv::DualChannelOhlcv;
pub use trackers::{ConfirmedSignalTracker, IntrabarSignalTracker};
