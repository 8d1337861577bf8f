pub mod core;
pub mod expander;
pub mod loader;

pub use self::core::Compiler;
pub use self::expander::Expander;
pub use self::loader::{load_process_from_yaml, load_processes_from_dir, parse_process_yaml};
