pub mod agent;
pub mod audio_sink;
pub mod capture;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod resample;
pub mod session;
pub mod transport;

use std::sync::{Mutex, MutexGuard};

pub use client::{ClientParts, ConnectionStatus, ConversationClient, SessionState};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use protocol::{SessionConfiguration, Transcript};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
