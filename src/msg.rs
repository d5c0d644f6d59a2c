use crossterm::event::KeyEvent;

use crate::store::{ConnectionStatus, PluginEntry, StoreError};

/// Results the store worker posts back to the UI loop.
#[derive(Debug)]
pub enum StoreEvent {
    /// The active location changed or its connection state moved.
    Location {
        label: String,
        status: Option<ConnectionStatus>,
    },
    Listing(Vec<PluginEntry>),
    Done(String),
    Failed(StoreError),
    /// The worker finished a request and is waiting for the next one.
    Idle,
}

/// All possible messages that drive state transitions.
#[derive(Debug)]
pub enum Msg {
    // -- Input events (raw)
    Key(KeyEvent),
    Resize(u16, u16),

    // -- Store
    Store(StoreEvent),
    DirectoryChanged,

    // -- System
    Tick,
    Quit,
}
