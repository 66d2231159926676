/// Error-recovery engine for Fibre-Channel adapters
///
/// This module implements the recovery state machine that restores a failed
/// adapter, remote port, or logical unit to working order:
/// - Escalation and admission control for requested recovery actions
/// - Two ordered per-adapter queues (ready / running) with FIFO execution
/// - A dedicated worker thread per adapter driving the per-level strategies
/// - Dismissal of actions superseded by stronger ones
/// - Bounded retries with permanent-failure marking and follow-up actions
///
/// # Architecture
///
/// ```text
/// ┌──────────────────────────────────────────────┐
/// │   Entry points (reopen / shutdown / fail)     │
/// └───────────────────┬──────────────────────────┘
///                     │
///         ┌───────────┴────────────┐
///         ↓                        ↓
/// ┌───────────────┐        ┌──────────────┐
/// │  Escalation &  │        │  Dismissal   │
/// │   Admission    │        │  (subtree)   │
/// └───────┬────────┘        └──────────────┘
///         │  ready queue
///         ↓
/// ┌──────────────────────────────────────────────┐
/// │        Worker loop (one thread/adapter)       │
/// │   ┌────────────────────────────────────────┐ │
/// │   │ Strategies                             │ │
/// │   │  - Adapter reopen                      │ │
/// │   │  - Forced port reopen                  │ │
/// │   │  - Port reopen (fabric / p2p)          │ │
/// │   │  - Unit reopen                         │ │
/// │   └────────────────────────────────────────┘ │
/// └───────────────────┬──────────────────────────┘
///                     ↓
/// ┌──────────────────────────────────────────────┐
/// │  Outcome propagation: retries, failure marks, │
/// │  unblocking, follow-up actions                │
/// └──────────────────────────────────────────────┘
/// ```
pub mod action;
pub mod admission;
pub mod backoff;
pub mod outcome;
pub mod queues;
pub mod strategies;
pub mod worker;

// Re-export main types for convenience
pub use action::{ActionFlags, ActionKind, ActionOutcome, ErpAction, ErpStep, StepOutcome};
pub use backoff::ExponentialBackoff;
