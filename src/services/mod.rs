//! Services Layer
//!
//! Logic shared between the feed binary and library consumers that sits
//! above a single broker call.
//!
//! # Services
//!
//! - `SymbolService` - Master contract ingestion, token lookup

pub mod symbol_service;

pub use symbol_service::SymbolService;
