//! Tokio driver for the session manager.
//!
//! The core state machines are synchronous; this is the single event loop
//! that suspends on the shared signal channel, the ack responder queue, and
//! the aggregated timer deadline, and feeds each wakeup back into the
//! manager. One task, one call stack at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::instrument;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::protocol::packet::{Data, Packet};
use crate::session::channel::AckCallback;
use crate::session::manager::{Manager, ManagerEvent};
use crate::transport::{TransportFactory, TransportSignal};

/// A driven session client.
///
/// Owns the [`Manager`] and the receiving ends of its channels; call
/// [`Client::next_event`] in a loop to run the connection.
pub struct Client {
    manager: Manager,
    signals: UnboundedReceiver<TransportSignal>,
    outbound: UnboundedReceiver<Packet>,
}

impl Client {
    /// Build a client for a target URI.
    #[instrument(skip(factory))]
    pub fn connect(uri: &str, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        Self::with_config(SessionConfig::from_uri(uri)?, factory)
    }

    /// Build a client from an explicit configuration.
    pub fn with_config(config: SessionConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate_strict()?;

        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let manager = Manager::new(config, factory, signal_tx, outbound_tx);

        Ok(Self {
            manager,
            signals,
            outbound,
        })
    }

    pub fn manager(&mut self) -> &mut Manager {
        &mut self.manager
    }

    /// Get or create a namespace channel and connect it.
    pub fn channel(&mut self, nsp: &str) {
        self.manager.channel(nsp, None);
    }

    /// Emit an application event on a namespace.
    pub fn emit(&mut self, nsp: &str, name: &str, args: Vec<Data>) -> Result<()> {
        self.manager.emit(nsp, name, args)
    }

    /// Emit with an acknowledgement callback.
    pub fn emit_with_ack(
        &mut self,
        nsp: &str,
        name: &str,
        args: Vec<Data>,
        ack: AckCallback,
    ) -> Result<()> {
        self.manager.emit_with_ack(nsp, name, args, ack)
    }

    /// Run the event loop until the next application-facing event.
    ///
    /// Returns `None` if every signal source closed, which only happens when
    /// the manager side has been torn down.
    pub async fn next_event(&mut self) -> Option<ManagerEvent> {
        loop {
            if let Some(event) = self.manager.poll_event() {
                return Some(event);
            }

            let deadline = self.manager.poll_deadline();
            tokio::select! {
                maybe_signal = self.signals.recv() => match maybe_signal {
                    Some(signal) => self.manager.handle_signal(signal),
                    None => return None,
                },
                maybe_packet = self.outbound.recv() => match maybe_packet {
                    Some(packet) => self.manager.packet(packet),
                    None => return None,
                },
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    self.manager.handle_timeout(Instant::now());
                }
            }
        }
    }
}

fn sleep_until_deadline(deadline: Option<Instant>) -> tokio::time::Sleep {
    let target = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
    tokio::time::sleep_until(tokio::time::Instant::from_std(target))
}
