//! Applications that run on a [`Node`](crate::node::Node).

mod echo;
pub use echo::Echo;

mod ping;
pub use ping::Ping;
