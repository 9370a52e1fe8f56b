#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end session flows against a scripted transport
//! Exercises the public extension surface: a custom transport factory wired
//! through the signal channel, driven by the client event loop

use std::sync::{Arc, Mutex};

use realtime_protocol::core::frame::Frame;
use realtime_protocol::core::payload::{decode_frame, WireData};
use realtime_protocol::error::Result;
use realtime_protocol::protocol::packet::Data;
use realtime_protocol::session::channel::ChannelEvent;
use realtime_protocol::transport::{
    IoCompletion, SignalSink, Transport, TransportEvent, TransportState,
};
use realtime_protocol::{
    Client, ManagerEvent, SessionConfig, TransportFactory, TransportKind, TransportOptions,
};

const HANDSHAKE: &str =
    "0{\"sid\":\"sess-1\",\"upgrades\":[\"persistent-socket\"],\"pingInterval\":25000,\"pingTimeout\":5000}";

// ============================================================================
// SCRIPTED TRANSPORT
// ============================================================================

#[derive(Default)]
struct ScriptedState {
    state: TransportState,
    writable: bool,
    written: Vec<Frame>,
    closed: bool,
}

struct ScriptedTransport {
    kind: TransportKind,
    shared: Arc<Mutex<ScriptedState>>,
    sink: SignalSink,
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn ready_state(&self) -> TransportState {
        self.shared.lock().unwrap().state
    }

    fn writable(&self) -> bool {
        self.shared.lock().unwrap().writable
    }

    fn supports_binary(&self) -> bool {
        true
    }

    fn open(&mut self) {
        self.shared.lock().unwrap().state = TransportState::Opening;
    }

    fn close(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.state = TransportState::Closed;
        shared.closed = true;
    }

    fn write(&mut self, frames: Vec<Frame>) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        shared.written.extend(frames);
        // scripted transports stay writable; drains arrive immediately
        drop(shared);
        self.sink.event(TransportEvent::Drain);
        Ok(())
    }

    fn pause(&mut self) {
        self.shared.lock().unwrap().state = TransportState::Paused;
        self.sink.event(TransportEvent::Paused);
    }

    fn handle_io(&mut self, completion: IoCompletion) {
        match completion {
            IoCompletion::Connected => {
                let mut shared = self.shared.lock().unwrap();
                shared.state = TransportState::Open;
                shared.writable = true;
                drop(shared);
                self.sink.event(TransportEvent::Open);
            }
            IoCompletion::Data(data) => {
                self.sink.event(TransportEvent::Packet(decode_frame(&data)));
            }
            IoCompletion::Error(message) => self.sink.event(TransportEvent::Error {
                message,
                description: None,
            }),
            IoCompletion::Closed => {
                self.shared.lock().unwrap().state = TransportState::Closed;
                self.sink.event(TransportEvent::Close);
            }
            IoCompletion::WriteDone => {}
        }
    }

    fn set_session_id(&mut self, _sid: &str) {}
}

#[derive(Clone)]
struct ScriptedHandle {
    kind: TransportKind,
    shared: Arc<Mutex<ScriptedState>>,
    sink: SignalSink,
}

impl ScriptedHandle {
    fn connect(&self) {
        self.sink.io(IoCompletion::Connected);
    }

    fn frame(&self, encoded: &str) {
        self.sink
            .io(IoCompletion::Data(WireData::Text(encoded.to_string())));
    }

    fn written(&self) -> Vec<Frame> {
        self.shared.lock().unwrap().written.clone()
    }

    fn closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }
}

#[derive(Default)]
struct ScriptedFactory {
    created: Mutex<Vec<ScriptedHandle>>,
}

impl ScriptedFactory {
    fn handle(&self, index: usize) -> ScriptedHandle {
        self.created.lock().unwrap()[index].clone()
    }

    fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(
        &self,
        kind: TransportKind,
        _options: TransportOptions,
        sink: SignalSink,
    ) -> Result<Box<dyn Transport>> {
        let shared = Arc::new(Mutex::new(ScriptedState::default()));
        self.created.lock().unwrap().push(ScriptedHandle {
            kind,
            shared: shared.clone(),
            sink: sink.clone(),
        });
        Ok(Box::new(ScriptedTransport { kind, shared, sink }))
    }
}

fn client(factory: Arc<ScriptedFactory>) -> Client {
    let config = SessionConfig::default_with_overrides(|c| {
        c.reconnection = false;
    });
    Client::with_config(config, factory).unwrap()
}

/// Drive the client until the predicate matches or the budget runs out.
async fn drive_until(
    client: &mut Client,
    mut predicate: impl FnMut(&ManagerEvent) -> bool,
) -> Option<ManagerEvent> {
    for _ in 0..64 {
        match client.next_event().await {
            Some(event) if predicate(&event) => return Some(event),
            Some(_) => {}
            None => break,
        }
    }
    None
}

// ============================================================================
// FLOWS
// ============================================================================

#[tokio::test]
async fn test_connect_upgrade_and_event_round_trip() {
    let factory = Arc::new(ScriptedFactory::default());
    let mut client = client(factory.clone());
    client.channel("/");

    let polling = factory.handle(0);
    assert_eq!(polling.kind, TransportKind::Polling);
    polling.connect();
    polling.frame(HANDSHAKE);
    polling.frame("40");

    assert!(drive_until(&mut client, |e| matches!(
        e,
        ManagerEvent::Channel {
            event: ChannelEvent::Connect,
            ..
        }
    ))
    .await
    .is_some());

    // the handshake offered an upgrade, so a probe is running
    assert_eq!(factory.count(), 2);
    let probe = factory.handle(1);
    assert_eq!(probe.kind, TransportKind::PersistentSocket);
    probe.connect();
    probe.frame("3probe");
    // a server event on the socket proves the swap went through
    probe.frame("420[\"news\",\"flash\"]");

    let received = drive_until(&mut client, |e| {
        matches!(
            e,
            ManagerEvent::Channel {
                event: ChannelEvent::Event { name, .. },
                ..
            } if name == "news"
        )
    })
    .await;
    assert!(received.is_some());

    // the polling transport was paused out and replaced
    assert!(polling.closed());

    // emits now travel over the socket
    client
        .emit("/", "greeting", vec![Data::from("hello")])
        .unwrap();
    let socket_frames = probe.written();
    assert!(socket_frames
        .iter()
        .any(|f| f.data.as_text() == Some("20[\"greeting\",\"hello\"]")));
}

#[tokio::test]
async fn test_ack_round_trip_through_the_driver() {
    let factory = Arc::new(ScriptedFactory::default());
    let config = SessionConfig::default_with_overrides(|c| {
        c.reconnection = false;
        c.connection.upgrade = false;
    });
    let mut client = Client::with_config(config, factory.clone()).unwrap();
    client.channel("/");

    let transport = factory.handle(0);
    transport.connect();
    transport.frame(HANDSHAKE);
    transport.frame("40");

    drive_until(&mut client, |e| {
        matches!(
            e,
            ManagerEvent::Channel {
                event: ChannelEvent::Connect,
                ..
            }
        )
    })
    .await
    .unwrap();

    let answered = Arc::new(Mutex::new(None));
    let sink = answered.clone();
    client
        .emit_with_ack(
            "/",
            "question",
            vec![Data::from("ping?")],
            Box::new(move |args| {
                *sink.lock().unwrap() = Some(args);
            }),
        )
        .unwrap();

    // server acknowledges ack id 0, then sends an observable event so the
    // driver loop has something to return
    transport.frame("430[\"pong!\"]");
    transport.frame("420[\"done\"]");
    drive_until(&mut client, |e| {
        matches!(
            e,
            ManagerEvent::Channel {
                event: ChannelEvent::Event { name, .. },
                ..
            } if name == "done"
        )
    })
    .await
    .unwrap();

    assert_eq!(
        answered.lock().unwrap().clone(),
        Some(vec![Data::from("pong!")])
    );
}

#[tokio::test]
async fn test_server_disconnect_closes_the_session() {
    let factory = Arc::new(ScriptedFactory::default());
    let mut client = client(factory.clone());
    client.channel("/");

    let transport = factory.handle(0);
    transport.connect();
    transport.frame(HANDSHAKE);
    transport.frame("40");
    drive_until(&mut client, |e| {
        matches!(
            e,
            ManagerEvent::Channel {
                event: ChannelEvent::Connect,
                ..
            }
        )
    })
    .await
    .unwrap();

    transport.frame("41");
    let disconnect = drive_until(&mut client, |e| {
        matches!(
            e,
            ManagerEvent::Channel {
                event: ChannelEvent::Disconnect { .. },
                ..
            }
        )
    })
    .await;

    match disconnect {
        Some(ManagerEvent::Channel {
            event: ChannelEvent::Disconnect { reason },
            ..
        }) => assert_eq!(reason, "io server disconnect"),
        other => panic!("unexpected event: {other:?}"),
    }
}
