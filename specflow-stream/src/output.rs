//! Output ports: named float streams fanned out to connected consumers.
//!
//! Each connection receives every packet written after it attaches, plus a
//! replay of the current SRI of any open stream so late joiners can label
//! the data. A port with no connections reports `Idle`; the engine uses that
//! to skip work nobody would see.

use crate::sri::Sri;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Downstream demand on a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// No consumer attached
    Idle,
    /// At least one consumer attached
    Active,
}

/// One unit of output transport
#[derive(Debug, Clone)]
pub enum StreamPacket {
    Sri { stream_id: String, sri: Sri },
    Data {
        stream_id: String,
        data: Vec<f32>,
        time: f64,
    },
    Eos { stream_id: String },
}

type ConnectionListener = Box<dyn Fn(&str) + Send + Sync>;

struct OutPortShared {
    name: String,
    connections: Mutex<Vec<(String, Sender<StreamPacket>)>>,
    /// Current SRI per open stream, replayed to new connections
    stream_sris: Mutex<HashMap<String, Sri>>,
    listener: Mutex<Option<ConnectionListener>>,
}

impl OutPortShared {
    fn send(&self, packet: StreamPacket) {
        let connections = self.connections.lock().unwrap();
        for (_, tx) in connections.iter() {
            // a consumer that dropped its receiver just misses packets until
            // it formally disconnects
            let _ = tx.send(packet.clone());
        }
    }

    fn notify_listener(&self, connection_id: &str) {
        let listener = self.listener.lock().unwrap();
        if let Some(cb) = listener.as_ref() {
            cb(connection_id);
        }
    }
}

/// Output port carrying any number of named float streams.
#[derive(Clone)]
pub struct OutFloatPort {
    shared: Arc<OutPortShared>,
}

impl OutFloatPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(OutPortShared {
                name: name.into(),
                connections: Mutex::new(Vec::new()),
                stream_sris: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Attach a consumer; returns its packet receiver. Open-stream SRIs are
    /// replayed onto the new connection before any further packets.
    pub fn connect(&self, connection_id: impl Into<String>) -> Receiver<StreamPacket> {
        let connection_id = connection_id.into();
        let (tx, rx) = unbounded();
        {
            let sris = self.shared.stream_sris.lock().unwrap();
            for (stream_id, sri) in sris.iter() {
                let _ = tx.send(StreamPacket::Sri {
                    stream_id: stream_id.clone(),
                    sri: sri.clone(),
                });
            }
            let mut connections = self.shared.connections.lock().unwrap();
            connections.push((connection_id.clone(), tx));
        }
        debug!(port = %self.shared.name, connection = %connection_id, "consumer connected");
        self.shared.notify_listener(&connection_id);
        rx
    }

    /// Detach a consumer by id
    pub fn disconnect(&self, connection_id: &str) {
        {
            let mut connections = self.shared.connections.lock().unwrap();
            connections.retain(|(id, _)| id != connection_id);
        }
        debug!(port = %self.shared.name, connection = %connection_id, "consumer disconnected");
        self.shared.notify_listener(connection_id);
    }

    pub fn state(&self) -> PortState {
        if self.shared.connections.lock().unwrap().is_empty() {
            PortState::Idle
        } else {
            PortState::Active
        }
    }

    /// Register the callback invoked on every connect and disconnect
    pub fn set_connection_listener(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.listener.lock().unwrap() = Some(Box::new(listener));
    }

    /// Open a named stream for writing
    pub fn create_stream(&self, stream_id: impl Into<String>) -> OutFloatStream {
        OutFloatStream {
            shared: self.shared.clone(),
            stream_id: stream_id.into(),
            closed: false,
        }
    }
}

/// Writer half of one output stream.
pub struct OutFloatStream {
    shared: Arc<OutPortShared>,
    stream_id: String,
    closed: bool,
}

impl OutFloatStream {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Publish or update the stream's SRI
    pub fn sri(&self, sri: Sri) {
        self.shared
            .stream_sris
            .lock()
            .unwrap()
            .insert(self.stream_id.clone(), sri.clone());
        self.shared.send(StreamPacket::Sri {
            stream_id: self.stream_id.clone(),
            sri,
        });
    }

    /// Write one vector tagged with a timestamp
    pub fn write(&self, data: &[f32], time: f64) {
        trace!(stream = %self.stream_id, len = data.len(), "write");
        self.shared.send(StreamPacket::Data {
            stream_id: self.stream_id.clone(),
            data: data.to_vec(),
            time,
        });
    }

    /// Propagate end-of-stream to all consumers
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared
            .stream_sris
            .lock()
            .unwrap()
            .remove(&self.stream_id);
        self.shared.send(StreamPacket::Eos {
            stream_id: self.stream_id.clone(),
        });
        debug!(stream = %self.stream_id, "output stream closed");
    }
}

impl Drop for OutFloatStream {
    fn drop(&mut self) {
        self.close();
    }
}
