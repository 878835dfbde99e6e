/*
The relay client shall:
- connect to the control-plane relay, retrying with exponential backoff
- be event driven: one reader task dispatches every frame it receives
- send requests tagged with a client-chosen id and wait, bounded by a
  timeout, for the reply carrying the same id
- register a subscription's callback before the SUB request leaves, so an
  indication that races the acknowledgement is never lost
- hand every IND frame to the callback registered for its id, on the
  reader task
- fail pending requests when the connection is lost

Protocol description.

Every frame is a fixed header followed by a JSON payload.

- version 8-bit unsigned int == 0x01
- command 8-bit unsigned int
- id 16-bit unsigned int          0 is not a valid id
- size 16-bit unsigned int        payload length
- time_us 64-bit unsigned int, UTC microseconds
- data size bytes of JSON

command
- CMD_LIST id, no data
  - reply: CMD_LIST id, data is the list of connected nodes
- CMD_SUB id, data is {node, model, definition}
  - the id becomes the subscription handle
  - reply: CMD_SUB id, no data
- CMD_UNSUB id of the subscription
  - reply: CMD_UNSUB id, no data
- CMD_IND id of the subscription, data is one indication message
  - no reply
- CMD_ERR id of the failed request, data is the reason as text
*/

use crate::control_plane::{
    ControlPlane, IndicationCallback, IndicationMessage, NodeDescriptor, NodeId, RawHandle,
    SubscriptionDefinition,
};
use crate::error::ControlPlaneError;
use crate::measurement::ServiceModel;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// Protocol constants
const PROTOCOL_VERSION: u8 = 0x01;
const HEADER_LEN: usize = 14;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

// Commands
pub const CMD_LIST: u8 = 1;
pub const CMD_SUB: u8 = 2;
pub const CMD_UNSUB: u8 = 3;
pub const CMD_IND: u8 = 4;
pub const CMD_ERR: u8 = 5;

fn command_text(command: u8) -> &'static str {
    match command {
        CMD_LIST => "CMD_LIST",
        CMD_SUB => "CMD_SUB",
        CMD_UNSUB => "CMD_UNSUB",
        CMD_IND => "CMD_IND",
        CMD_ERR => "CMD_ERR",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub id: u16,
    pub time_us: u64,
    pub data: Vec<u8>,
}

pub fn protocol_encode(
    command: u8,
    id: u16,
    time_us: u64,
    data: &[u8],
) -> Result<Vec<u8>, ControlPlaneError> {
    if data.len() > MAX_PAYLOAD {
        return Err(ControlPlaneError::FrameTooLarge {
            size: data.len(),
            max: MAX_PAYLOAD,
        });
    }
    let mut buffer = Vec::with_capacity(HEADER_LEN + data.len());
    buffer.push(PROTOCOL_VERSION);
    buffer.push(command);
    buffer.extend_from_slice(&id.to_be_bytes());
    buffer.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buffer.extend_from_slice(&time_us.to_be_bytes());
    buffer.extend_from_slice(data);
    Ok(buffer)
}

/// Decode the first frame in `buffer`. Returns the frame and the number of
/// bytes it used, or `None` while the frame is still incomplete.
pub fn protocol_decode(buffer: &[u8]) -> Result<Option<(Frame, usize)>, ControlPlaneError> {
    if buffer.len() < HEADER_LEN {
        return Ok(None);
    }

    let version = buffer[0];
    if version != PROTOCOL_VERSION {
        return Err(ControlPlaneError::Protocol(format!(
            "invalid protocol version 0x{:02x}",
            version
        )));
    }

    let command = buffer[1];
    let id = u16::from_be_bytes([buffer[2], buffer[3]]);
    let size = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
    let time_us = u64::from_be_bytes([
        buffer[6], buffer[7], buffer[8], buffer[9],
        buffer[10], buffer[11], buffer[12], buffer[13],
    ]);

    let total = HEADER_LEN + size;
    if buffer.len() < total {
        return Ok(None);
    }
    let frame = Frame {
        command,
        id,
        time_us,
        data: buffer[HEADER_LEN..total].to_vec(),
    };
    Ok(Some((frame, total)))
}

fn now_us() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

fn log_frame(direction: &str, frame: &Frame) {
    tracing::trace!(
        direction,
        command = command_text(frame.command),
        id = frame.id,
        size = frame.data.len(),
        time_us = frame.time_us,
        "Relay frame"
    );
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    node: &'a NodeId,
    model: ServiceModel,
    definition: &'a SubscriptionDefinition,
}

type ReplySender = oneshot::Sender<Frame>;

/// State shared between the client and its reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u16, ReplySender>>,
    callbacks: Mutex<HashMap<u16, IndicationCallback>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn dispatch(&self, frame: Frame) {
        log_frame("Received", &frame);
        match frame.command {
            CMD_IND => {
                let callback = lock(&self.callbacks).get(&frame.id).cloned();
                let callback = match callback {
                    Some(callback) => callback,
                    None => {
                        tracing::debug!(id = frame.id, "Indication for unknown subscription");
                        return;
                    }
                };
                match serde_json::from_slice::<IndicationMessage>(&frame.data) {
                    Ok(msg) => callback(msg),
                    Err(e) => tracing::warn!(id = frame.id, error = %e, "Malformed indication"),
                }
            }
            CMD_LIST | CMD_SUB | CMD_UNSUB | CMD_ERR => {
                match lock(&self.pending).remove(&frame.id) {
                    Some(reply) => {
                        // The requester may have timed out already.
                        let _ = reply.send(frame);
                    }
                    None => tracing::debug!(
                        id = frame.id,
                        command = command_text(frame.command),
                        "Reply without a pending request"
                    ),
                }
            }
            other => tracing::warn!(command = other, "Unknown relay command"),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders fails every waiting request.
        lock(&self.pending).clear();
        lock(&self.callbacks).clear();
    }
}

async fn read_loop(mut stream: OwnedReadHalf, shared: Arc<Shared>) {
    let mut buffer = vec![0u8; 4096];
    let mut read_buffer = Vec::new();

    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => {
                tracing::warn!("Relay closed the connection");
                break;
            }
            Ok(n) => {
                read_buffer.extend_from_slice(&buffer[..n]);
                loop {
                    match protocol_decode(&read_buffer) {
                        Ok(Some((frame, used))) => {
                            read_buffer.drain(..used);
                            shared.dispatch(frame);
                        }
                        Ok(None) => break, // Wait for more data
                        Err(e) => {
                            tracing::error!(error = %e, "Relay stream corrupt, dropping connection");
                            shared.close();
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Error reading from relay");
                break;
            }
        }
    }
    shared.close();
}

/// Control plane reached through a relay over TCP.
pub struct RelayControlPlane {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    next_id: AtomicU16,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl RelayControlPlane {
    /// Connect, waiting 1, 2, 4... seconds (at most 60) between attempts.
    pub async fn connect(
        host: &str,
        port: u16,
        attempts: u32,
        request_timeout: Duration,
    ) -> Result<Self, ControlPlaneError> {
        let addr = format!("{}:{}", host, port);
        let attempts = attempts.max(1);
        let mut reconnect_attempts: u32 = 0;

        loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    tracing::info!(addr = %addr, "Connected to control-plane relay");
                    return Ok(Self::from_stream(stream, request_timeout));
                }
                Err(e) => {
                    reconnect_attempts += 1;
                    if reconnect_attempts >= attempts {
                        tracing::error!(addr = %addr, error = %e, "Relay unreachable, giving up");
                        return Err(ControlPlaneError::Network(e));
                    }
                    let delay = std::cmp::min(1u64 << (reconnect_attempts - 1).min(6), 60);
                    tracing::warn!(
                        addr = %addr,
                        error = %e,
                        "Connection attempt failed. Waiting {} seconds before reconnecting",
                        delay
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    fn from_stream(stream: TcpStream, request_timeout: Duration) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Could not disable Nagle");
        }
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared::default());
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared)));
        RelayControlPlane {
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            next_id: AtomicU16::new(1),
            request_timeout,
            reader,
        }
    }

    /// Ids wrap at u16; 0 and ids held by a live subscription or an
    /// outstanding request are skipped.
    fn next_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 || lock(&self.shared.callbacks).contains_key(&id) {
                continue;
            }
            if lock(&self.shared.pending).contains_key(&id) {
                continue;
            }
            return id;
        }
    }

    async fn request(&self, command: u8, id: u16, data: &[u8]) -> Result<Frame, ControlPlaneError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ControlPlaneError::Closed);
        }
        let packet = protocol_encode(command, id, now_us(), data)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, reply_tx);

        tracing::trace!(command = command_text(command), id, size = data.len(), "Sending relay frame");
        let sent = {
            let mut writer = self.writer.lock().await;
            writer.write_all(&packet).await
        };
        if let Err(e) = sent {
            lock(&self.shared.pending).remove(&id);
            return Err(ControlPlaneError::Network(e));
        }

        let reply = match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ControlPlaneError::Closed),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                return Err(ControlPlaneError::Timeout);
            }
        };

        if reply.command == CMD_ERR {
            return Err(ControlPlaneError::Rejected(
                String::from_utf8_lossy(&reply.data).into_owned(),
            ));
        }
        if reply.command != command {
            return Err(ControlPlaneError::Protocol(format!(
                "expected {} reply, got {}",
                command_text(command),
                command_text(reply.command)
            )));
        }
        Ok(reply)
    }
}

#[async_trait]
impl ControlPlane for RelayControlPlane {
    async fn list_connected_nodes(&self) -> Result<Vec<NodeDescriptor>, ControlPlaneError> {
        let reply = self.request(CMD_LIST, self.next_id(), &[]).await?;
        Ok(serde_json::from_slice(&reply.data)?)
    }

    async fn subscribe(
        &self,
        node: &NodeId,
        model: ServiceModel,
        definition: &SubscriptionDefinition,
        callback: IndicationCallback,
    ) -> Result<RawHandle, ControlPlaneError> {
        let payload = serde_json::to_vec(&SubscribeRequest {
            node,
            model,
            definition,
        })?;
        let id = self.next_id();

        lock(&self.shared.callbacks).insert(id, callback);
        match self.request(CMD_SUB, id, &payload).await {
            Ok(_) => Ok(RawHandle(id as u64)),
            Err(e) => {
                lock(&self.shared.callbacks).remove(&id);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, handle: RawHandle) -> Result<(), ControlPlaneError> {
        let id = u16::try_from(handle.0).map_err(|_| ControlPlaneError::UnknownHandle(handle.0))?;
        if lock(&self.shared.callbacks).remove(&id).is_none() {
            return Err(ControlPlaneError::UnknownHandle(handle.0));
        }
        self.request(CMD_UNSUB, id, &[]).await?;
        Ok(())
    }
}

impl Drop for RelayControlPlane {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{MacIndication, NodeType, Plmn};
    use crate::measurement::{MacUeStats, ReportInterval};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_header_layout() {
        let packet = protocol_encode(CMD_SUB, 0x0102, 0x1122334455667788, b"{}").unwrap();
        assert_eq!(
            packet,
            vec![
                0x01, CMD_SUB, 0x01, 0x02, 0x00, 0x02, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
                0x88, b'{', b'}'
            ]
        );
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let packet = protocol_encode(CMD_IND, 7, 1, b"[1,2,3]").unwrap();
        assert_eq!(protocol_decode(&packet[..10]).unwrap(), None);
        assert_eq!(protocol_decode(&packet[..packet.len() - 1]).unwrap(), None);

        let mut two = packet.clone();
        two.extend_from_slice(&protocol_encode(CMD_ERR, 8, 2, b"no").unwrap());
        let (frame, used) = protocol_decode(&two).unwrap().unwrap();
        assert_eq!(used, packet.len());
        assert_eq!(frame.command, CMD_IND);
        assert_eq!(frame.id, 7);
        assert_eq!(frame.data, b"[1,2,3]");

        let (frame, _) = protocol_decode(&two[used..]).unwrap().unwrap();
        assert_eq!(frame.command, CMD_ERR);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut packet = protocol_encode(CMD_LIST, 1, 0, &[]).unwrap();
        packet[0] = 0x02;
        assert!(matches!(
            protocol_decode(&packet),
            Err(ControlPlaneError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let data = vec![b'x'; MAX_PAYLOAD + 1];
        assert!(matches!(
            protocol_encode(CMD_SUB, 1, 0, &data),
            Err(ControlPlaneError::FrameTooLarge { .. })
        ));
    }

    fn test_node() -> NodeDescriptor {
        NodeDescriptor {
            node_type: NodeType::Gnb,
            id: NodeId {
                plmn: Plmn { mcc: 1, mnc: 1 },
                nb_id: 3584,
            },
            ran_functions: vec![142, 143, 144, 148],
        }
    }

    async fn send(stream: &mut TcpStream, command: u8, id: u16, data: &[u8]) {
        let packet = protocol_encode(command, id, 0, data).unwrap();
        stream.write_all(&packet).await.unwrap();
    }

    /// Minimal relay: answers LIST, refuses PDCP subscriptions, follows every
    /// other SUB acknowledgement with two MAC indications.
    async fn fake_relay(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut read_buffer = Vec::new();
        let mut buffer = vec![0u8; 4096];
        loop {
            let n = match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            read_buffer.extend_from_slice(&buffer[..n]);
            while let Some((frame, used)) = protocol_decode(&read_buffer).unwrap() {
                read_buffer.drain(..used);
                match frame.command {
                    CMD_LIST => {
                        let nodes = serde_json::to_vec(&vec![test_node()]).unwrap();
                        send(&mut stream, CMD_LIST, frame.id, &nodes).await;
                    }
                    CMD_SUB => {
                        let request: serde_json::Value =
                            serde_json::from_slice(&frame.data).unwrap();
                        if request["model"] == "pdcp" {
                            send(&mut stream, CMD_ERR, frame.id, b"PDCP not supported").await;
                            continue;
                        }
                        send(&mut stream, CMD_SUB, frame.id, &[]).await;
                        for rnti in [1u32, 2] {
                            let msg = IndicationMessage::Mac(MacIndication {
                                tstamp_us: 0,
                                ue_stats: vec![MacUeStats {
                                    rnti,
                                    ..Default::default()
                                }],
                            });
                            let data = serde_json::to_vec(&msg).unwrap();
                            send(&mut stream, CMD_IND, frame.id, &data).await;
                        }
                    }
                    CMD_UNSUB => send(&mut stream, CMD_UNSUB, frame.id, &[]).await,
                    _ => {}
                }
            }
        }
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_relay(listener));

        let relay = RelayControlPlane::connect("127.0.0.1", port, 1, Duration::from_secs(2))
            .await
            .unwrap();

        let nodes = relay.list_connected_nodes().await.unwrap();
        assert_eq!(nodes, vec![test_node()]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: IndicationCallback = Arc::new(move |msg: IndicationMessage| {
            let _ = tx.send(msg);
        });
        let definition = SubscriptionDefinition::Interval(ReportInterval::Ms10);
        let handle = relay
            .subscribe(&nodes[0].id, ServiceModel::Mac, &definition, callback.clone())
            .await
            .unwrap();

        for expected in [1u32, 2] {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match msg {
                IndicationMessage::Mac(mac) => assert_eq!(mac.ue_stats[0].rnti, expected),
                other => panic!("unexpected indication {:?}", other),
            }
        }

        let err = relay
            .subscribe(&nodes[0].id, ServiceModel::Pdcp, &definition, callback)
            .await
            .unwrap_err();
        match err {
            ControlPlaneError::Rejected(reason) => assert_eq!(reason, "PDCP not supported"),
            other => panic!("unexpected error {:?}", other),
        }

        relay.unsubscribe(handle).await.unwrap();
        assert!(matches!(
            relay.unsubscribe(handle).await,
            Err(ControlPlaneError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold the connection without ever answering.
        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let relay = RelayControlPlane::connect("127.0.0.1", port, 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(
            relay.list_connected_nodes().await,
            Err(ControlPlaneError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let relay = RelayControlPlane::connect("127.0.0.1", port, 1, Duration::from_secs(1))
            .await
            .unwrap();
        // Give the reader a moment to see the close.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            relay.list_connected_nodes().await,
            Err(ControlPlaneError::Closed) | Err(ControlPlaneError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = RelayControlPlane::connect("127.0.0.1", port, 1, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ControlPlaneError::Network(_))));
    }

    #[tokio::test]
    async fn test_wrapped_ids_skip_live_subscriptions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _idle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let relay = RelayControlPlane::connect("127.0.0.1", port, 1, Duration::from_secs(1))
            .await
            .unwrap();
        let callback: IndicationCallback = Arc::new(|_msg: IndicationMessage| {});
        lock(&relay.shared.callbacks).insert(1, callback);
        let (reply_tx, _reply_rx) = oneshot::channel();
        lock(&relay.shared.pending).insert(2, reply_tx);

        relay.next_id.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(relay.next_id(), u16::MAX);
        // 0 is reserved, 1 belongs to a subscription, 2 awaits a reply.
        assert_eq!(relay.next_id(), 3);
    }
}
