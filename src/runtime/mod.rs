pub mod args;

pub use args::{parse_runtime_args, RuntimeArgs};
