//! Core data model: the message envelope and reply addressing.

pub mod message;

pub use message::{MAX_REPLY_ADDRESS_LEN, Message, ReplyAddress, ReplyAddressError};
