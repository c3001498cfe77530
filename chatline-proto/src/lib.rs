//! Shared protocol definitions for the Chatline wire format.
//!
//! Clients talk to the relay over a single WebSocket carrying JSON text
//! frames. Requests are `{"action": ..., "data": {...}}` envelopes decoded
//! into [`request::ClientRequest`]; everything the relay pushes back is a
//! `{"type": ...}` object modelled by [`event::ServerEvent`].

pub mod codec;
pub mod event;
pub mod request;
