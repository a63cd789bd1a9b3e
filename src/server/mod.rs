// HTTP surface of the stream proxy.

pub mod handler;
