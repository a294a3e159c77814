pub mod convert;
pub mod fetch;
pub mod storage;
pub mod unpack;
pub mod warehouse;
