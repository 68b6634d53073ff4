//! Integration test common infrastructure.
//!
//! Spawns a real `kvsyncd` process per test and drives it over real
//! WebSocket connections, exercising the wire protocol end to end rather
//! than the internal room-actor API directly.

pub mod server;
