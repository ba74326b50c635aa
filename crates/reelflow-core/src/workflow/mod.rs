//! Workflow engine core: templates, planning, reference resolution and
//! checkpointed execution.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save and discovery
//! - `plan` -- reference graph, cycle detection and execution order
//! - `resolver` -- `${...}` resolution against the job document
//! - `condition` -- JEXL evaluator for `skip_if`
//! - `checkpoint` -- persists every step transition
//! - `executor` -- run_all / run_step / run_from and batch execution

pub mod checkpoint;
pub mod condition;
pub mod definition;
pub mod executor;
pub mod plan;
pub mod resolver;
