//! Streaming inference bridge
//!
//! Moves model loads and token generation onto a background worker and streams the
//! results back to whichever listener the foreground has registered.

pub mod channel;
pub mod command;
pub mod controller;
pub mod error;
pub mod registry;
pub mod session;

pub use channel::{ChannelCounts, TokenChannel, TokenProducer};
pub use command::{BridgeCommand, CommandError};
pub use controller::SessionController;
pub use error::{BridgeError, DeliveryError, GenerateError, LoadError};
pub use registry::{Listener, ListenerId, ListenerRegistry};
pub use session::{GenerationPermit, LoadPermit, ModelSession, SessionState};

use std::any::Any;

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::bridge::registry::Listener;
    use crate::types::event::BridgeEvent;

    /// Listener forwarding every event into an unbounded channel
    pub struct Forward(mpsc::UnboundedSender<BridgeEvent>);

    impl Forward {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BridgeEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self(tx)), rx)
        }
    }

    impl Listener for Forward {
        fn on_event(&self, event: &BridgeEvent) {
            let _ = self.0.send(event.clone());
        }
    }

    pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> BridgeEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("listener channel closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");
    }
}
