//! Protocol Layer: message antara engine dan event loop
//!
//! Prinsip desain:
//! - Flat message: (kind, id, param), tanpa payload heap
//! - Engine tidak pernah polling; semua completion datang sebagai message

mod message;

pub use message::{Message, MessageKind, Progress};
