pub mod codec;
pub mod header;
pub mod hello;
pub mod kind;
pub mod message;
pub mod multipart;
pub mod version;
