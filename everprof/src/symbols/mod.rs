pub mod backend;
pub mod cache;
pub mod demangle;
pub mod symbol_map;

pub use backend::{Addr2LineBackend, BackendFrame, BackendResolution, SymbolBackend};
pub use cache::{Symbol, SymbolCache, SymbolTable};
pub use symbol_map::{SymbolMap, SymbolSpan, MAX_SYMBOL_SIZE, MIN_SYMBOL_SIZE};
