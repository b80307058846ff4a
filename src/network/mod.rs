pub mod constants;
pub mod probe;
pub mod scanner;
pub mod session;
pub mod types;
