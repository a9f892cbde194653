//! A runnable node on top of `cosim-comms-core`.
//!
//! A [`Node`](node::Node) owns one named comms instance and feeds whatever it
//! receives to an [`Application`](node::Application). The applications in
//! [`applications`] are enough to stand up a broker and measure round trips
//! to it over any transport.

pub mod applications;
pub mod cli;
pub mod node;
