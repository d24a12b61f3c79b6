pub mod protocol;
pub mod retry;
