#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod autonomy;
pub mod bulk;
pub mod config;
pub mod contract;
pub mod decompose;
pub mod error;
pub mod evaluate;
pub mod execute;
pub mod goal;
pub mod invariants;
pub mod mutate;
pub mod policy;
pub mod progress;
pub mod reflect;
pub mod safety;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod system_state;
pub mod transition;
