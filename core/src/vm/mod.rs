pub mod monitor;
pub mod process;
pub mod record;
pub mod supervisor;
