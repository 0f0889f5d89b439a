//! The metadata manager: recipe store (component D), callback registry
//! (component E), metadata op engine (component F), and the manager's
//! RPC surface.

pub mod callback_registry;
pub mod op_engine;
pub mod recipe_store;
pub mod server;

pub use op_engine::OpEngine;
