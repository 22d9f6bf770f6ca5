//! Fakes and builders for testing code on top of sessions and the reassembler. They are
//!  used by this crate's own tests, and they are exported for testing applications.
//!
//! The fakes share their state through `Rc<RefCell<..>>`, so a test can hand a clone to a
//!  session (which takes ownership of its collaborators) and keep another clone to script
//!  input and inspect what happened.

pub mod frames;
pub mod manual_timer;
pub mod messages;
pub mod recording_handler;
pub mod scripted_stream;
