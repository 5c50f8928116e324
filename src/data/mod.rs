//! Local data files and their hand-off to transfer.
pub mod stager;
pub mod storage;
