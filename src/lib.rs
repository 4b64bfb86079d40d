pub mod channel;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod logging;
pub mod notes;
pub mod protocol;
pub mod server;
pub mod storage;
