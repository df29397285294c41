pub mod bluetooth;
pub mod database;
pub mod logging;
