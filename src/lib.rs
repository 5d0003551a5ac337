pub mod authority;
pub mod config;
pub mod data;
pub mod ingest;
pub mod logging;
pub mod mode;
pub mod notify;
pub mod observe;
pub mod paper;
pub mod reliability;
pub mod ring;
pub mod storage;
pub mod theta;
pub mod types;
pub mod verify;
pub mod zone;
