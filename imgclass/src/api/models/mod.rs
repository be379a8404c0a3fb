//! Request and response types shared by the proxy and its clients.

pub mod classify;
