pub mod checkpoint;
pub mod data;
pub mod error;
pub mod init;
pub mod labels;
pub mod model;
pub mod retrieval;
pub mod telemetry;
pub mod training;
pub mod utils;
