//! Socket helpers shared by the signaling server and the ICE mux

pub mod net;

pub use net::{bind_tcp_listener, bind_udp_socket};
