// Top-level client façade: one object per signed-in user, wrapping the
// signaling channel, the sync engine and the transfer engine behind a
// single command surface and one merged notification stream.

pub mod client;
pub mod events;

pub use client::{ChatClient, ChatClientConfig};
pub use events::ClientNotification;
