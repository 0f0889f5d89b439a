//! Client side of the wire protocol: the manager RPC stub
//! ([`rpc::ManagerClient`]) and the chunked read/write pipeline
//! ([`pipeline::FileHandle`]) that sits on top of it, the hash cache,
//! and the CAS client.

pub mod callback_server;
pub mod pipeline;
pub mod rpc;

pub use callback_server::CallbackServer;
pub use pipeline::FileHandle;
pub use rpc::ManagerClient;
