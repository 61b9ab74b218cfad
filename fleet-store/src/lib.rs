pub mod bmc;
pub mod ctx;
pub mod db;
pub mod db_model_manager;

pub use bmc::*;
pub use ctx::*;
pub use db::*;
pub use db_model_manager::*;
