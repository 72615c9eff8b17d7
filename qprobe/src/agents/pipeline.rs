//! Wiring of the agents of one connection attempt.
//!
//! [`Pipeline::spawn`] creates every channel, subscribes every agent before
//! any of them runs, and starts them on the current runtime. The returned
//! receiver yields the datagrams to put on the wire; attach a socket with
//! [`Pipeline::attach_socket`] or forward them by hand.

use super::ack::AckAgent;
use super::buffer::BufferAgent;
use super::closing::ClosingAgent;
use super::flow_control::FlowControlAgent;
use super::frame_queue::FrameQueueAgent;
use super::handshake::HandshakeAgent;
use super::parser::ParserAgent;
use super::recovery::RecoveryAgent;
use super::rtt::{RttAgent, RttSnapshot};
use super::sender::{Producers, SenderAgent};
use super::socket::SocketAgent;
use super::stream::{StreamAgent, StreamCommand};
use super::{FrameQueueHandle, SenderHandle, SharedConnection, ShutdownTrigger};
use crate::channel_config::ChannelConfig;
use crate::config::AgentConfig;
use crate::topics::Topics;
use bytes::Bytes;
use parking_lot::Mutex;
use qprobe_quic::{Connection, ConnectionState, EncryptionLevel, Frame, Side, StreamId, TlsSession};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Errors of the pipeline's application interface
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stream {0} cannot send data from this side")]
    StreamDirection(StreamId),

    #[error("pipeline has shut down")]
    Stopped,

    #[error(transparent)]
    Engine(#[from] qprobe_quic::Error),
}

/// Handle to a running set of agents
pub struct Pipeline {
    conn: SharedConnection,
    topics: Topics,
    queue: FrameQueueHandle,
    streams: mpsc::Sender<StreamCommand>,
    rtt: watch::Receiver<RttSnapshot>,
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Start every agent for `conn`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        conn: Connection,
        tls: Box<dyn TlsSession>,
        agents: &AgentConfig,
        channels: &ChannelConfig,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        info!(
            side = ?conn.side(),
            version = format_args!("0x{:08x}", conn.version()),
            alpn = conn.alpn(),
            "starting pipeline"
        );

        let conn: SharedConnection = Arc::new(Mutex::new(conn));
        let topics = Topics::new(channels.topic_capacity);
        let trigger = ShutdownTrigger::new();

        let (outgoing_tx, outgoing_rx) = mpsc::channel(channels.command_capacity);
        let (queue_tx, queue_rx) = mpsc::channel(channels.command_capacity);
        let (sender_tx, sender_rx) = mpsc::channel(channels.command_capacity);
        let (stream_tx, stream_rx) = mpsc::channel(channels.command_capacity);
        let (queue_req_tx, queue_req_rx) = mpsc::channel(channels.frame_request_capacity);
        let (stream_req_tx, stream_req_rx) = mpsc::channel(channels.frame_request_capacity);
        let (flow_req_tx, flow_req_rx) = mpsc::channel(channels.frame_request_capacity);
        let (rtt_tx, rtt_rx) = watch::channel(RttSnapshot::default());

        let queue = FrameQueueHandle::new(queue_tx);
        let sender = SenderHandle::new(sender_tx);

        let frame_queue = FrameQueueAgent::new(
            channels.frame_queue_capacity,
            queue_rx,
            queue_req_rx,
            sender.clone(),
            trigger.subscribe(),
        );
        let sender_agent = SenderAgent::new(
            conn.clone(),
            topics.clone(),
            Producers {
                queue: queue_req_tx,
                streams: stream_req_tx,
                flow_control: flow_req_tx,
            },
            sender_rx,
            outgoing_tx,
            agents.mtu,
            agents.coalescing_delay(),
            trigger.subscribe(),
        );
        let parser = ParserAgent::new(conn.clone(), topics.clone(), trigger.subscribe());
        let buffer = BufferAgent::new(conn.clone(), &topics, trigger.subscribe());
        let ack = AckAgent::new(
            conn.clone(),
            queue.clone(),
            topics.packets_in.subscribe(),
            agents.suppress_acks,
            trigger.subscribe(),
        );
        let rtt = RttAgent::new(
            conn.clone(),
            topics.packets_out.subscribe(),
            topics.packets_in.subscribe(),
            rtt_tx,
            trigger.subscribe(),
        );
        let recovery = RecoveryAgent::new(
            topics.packets_out.subscribe(),
            topics.packets_in.subscribe(),
            topics.encryption_levels.subscribe(),
            topics.connection_state.subscribe(),
            agents.retransmit_threshold(),
            agents.recovery_tick(),
            queue.clone(),
            sender.clone(),
            trigger.subscribe(),
        );
        let stream = StreamAgent::new(
            conn.clone(),
            sender.clone(),
            stream_rx,
            stream_req_rx,
            topics.packets_in.subscribe(),
            topics.handshake_status.subscribe(),
            trigger.subscribe(),
        );
        let flow_control = FlowControlAgent::new(
            conn.clone(),
            sender,
            flow_req_rx,
            topics.stream_data.subscribe(),
            trigger.subscribe(),
        );
        let closing = ClosingAgent::new(conn.clone(), topics.clone(), trigger.clone());
        let handshake = HandshakeAgent::new(
            conn.clone(),
            tls,
            topics.clone(),
            queue.clone(),
            agents.mtu,
            trigger.subscribe(),
        );

        let tasks = vec![
            tokio::spawn(frame_queue.run()),
            tokio::spawn(sender_agent.run()),
            tokio::spawn(parser.run()),
            tokio::spawn(buffer.run()),
            tokio::spawn(ack.run()),
            tokio::spawn(rtt.run()),
            tokio::spawn(recovery.run()),
            tokio::spawn(stream.run()),
            tokio::spawn(flow_control.run()),
            tokio::spawn(closing.run()),
            // Last, so the client's first flight finds everyone listening
            tokio::spawn(handshake.run()),
        ];

        let pipeline = Self {
            conn,
            topics,
            queue,
            streams: stream_tx,
            rtt: rtt_rx,
            trigger,
            tasks,
        };
        (pipeline, outgoing_rx)
    }

    /// Carry the pipeline's datagrams over a connected UDP socket
    pub fn attach_socket(&mut self, socket: UdpSocket, outgoing: mpsc::Receiver<Bytes>) {
        let agent = SocketAgent::new(
            socket,
            outgoing,
            self.conn.clone(),
            self.topics.clone(),
            self.trigger.clone(),
        );
        self.tasks.push(tokio::spawn(agent.run()));
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    pub fn side(&self) -> Side {
        self.conn.lock().side()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.lock().state()
    }

    /// Latest RTT estimate
    pub fn rtt(&self) -> RttSnapshot {
        *self.rtt.borrow()
    }

    /// Claim the next locally initiated stream
    pub fn open_stream(&self, bidirectional: bool) -> StreamId {
        let mut conn = self.conn.lock();
        let id = conn.next_stream_id(bidirectional);
        conn.streams_mut().get_or_create(id);
        debug!(stream = id.value(), "stream opened");
        id
    }

    /// Queue `data` on a stream, closing it afterwards when `close` is set
    pub async fn write(&self, stream_id: StreamId, data: Bytes, close: bool) -> Result<(), PipelineError> {
        if !stream_id.can_send(self.side()) {
            return Err(PipelineError::StreamDirection(stream_id));
        }
        self.streams
            .send(StreamCommand::Write {
                stream_id,
                data,
                close,
            })
            .await
            .map_err(|_| PipelineError::Stopped)
    }

    /// Finish our side of a stream after the data already written
    pub async fn close_stream(&self, stream_id: StreamId) -> Result<(), PipelineError> {
        self.write(stream_id, Bytes::new(), true).await
    }

    pub async fn reset_stream(&self, stream_id: StreamId, error_code: u16) -> Result<(), PipelineError> {
        if !stream_id.can_send(self.side()) {
            return Err(PipelineError::StreamDirection(stream_id));
        }
        self.streams
            .send(StreamCommand::Reset {
                stream_id,
                error_code,
            })
            .await
            .map_err(|_| PipelineError::Stopped)
    }

    pub async fn stop_sending(&self, stream_id: StreamId, error_code: u16) -> Result<(), PipelineError> {
        if !stream_id.can_receive(self.side()) {
            return Err(PipelineError::StreamDirection(stream_id));
        }
        self.streams
            .send(StreamCommand::StopSending {
                stream_id,
                error_code,
            })
            .await
            .map_err(|_| PipelineError::Stopped)
    }

    /// Queue an arbitrary frame, e.g. a PING at `Best`
    pub async fn send_frame(&self, level: EncryptionLevel, frame: Frame) -> Result<(), PipelineError> {
        if self.queue.push(level, frame).await {
            Ok(())
        } else {
            Err(PipelineError::Stopped)
        }
    }

    /// Close the connection with a CONNECTION_CLOSE or APPLICATION_CLOSE
    /// frame; the pipeline stops after the draining period
    pub async fn close(&self, application: bool, error_code: u16, reason: &str) -> Result<(), PipelineError> {
        let frame = self.conn.lock().close(application, error_code, reason)?;
        info!(application, error_code, reason, "closing connection");
        self.send_frame(EncryptionLevel::Best, frame).await?;
        self.topics
            .connection_state
            .publish(ConnectionState::Closing)
            .await;
        Ok(())
    }

    /// Resolves once the pipeline shut down
    pub async fn closed(&self) {
        self.trigger.subscribe().recv().await;
    }

    /// Stop every agent and wait for them
    pub async fn shutdown(mut self) {
        self.trigger.fire();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.trigger.fire();
    }
}
