pub mod byte_stream;
pub mod connection;
pub mod event_loop;
pub mod frame_reader;
pub mod scheduler;
pub mod session;
pub mod tcp;
pub mod timer;
