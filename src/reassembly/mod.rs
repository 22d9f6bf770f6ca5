pub mod reassembling_handler;
pub mod segment_reassembler;
