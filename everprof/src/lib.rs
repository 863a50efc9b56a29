//! A continuous, sampling, whole-system profiler for Linux.
//!
//! The pipeline runs leaves-first: ring buffers deliver raw perf records,
//! the DSO registry and module loader resolve where code lives, the
//! unwinder recovers call chains from stack snapshots, the symbol cache
//! names each frame, and the aggregator folds everything into pprof
//! profiles shipped once per cycle.

pub mod aggregator;
pub mod build_id;
pub mod convert_regs;
pub mod dso;
pub mod dso_registry;
pub mod error;
pub mod file_info;
pub mod ipc;
pub mod module;
pub mod perf_event;
pub mod pprof;
pub mod proc_maps;
pub mod process;
pub mod pump;
pub mod section_data;
pub mod sink;
pub mod symbols;
pub mod sys;
pub mod unwind;
pub mod watcher;
