//! Reconnecting push-channel subscription for calendar slot events.
//!
//! The manager runs as one task that exclusively owns the socket. Commands
//! from the [`PushHandle`] (enable, disable, reconnect) are handled at every
//! suspension point, so a disable always cancels a pending reconnect timer
//! or an in-progress connect.

use std::sync::Arc;

use async_trait::async_trait;
use console_sdk::SlotChange;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::PushError;
use crate::metrics;
use crate::Deliver;

/// Opens one socket subscription.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushStream>, PushError>;
}

#[async_trait]
pub trait PushStream: Send {
    /// Next text frame in transport order; `None` once the peer closed.
    async fn next_frame(&mut self) -> Option<Result<String, PushError>>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Reconnecting,
    /// Parked: disabled by the caller or out of reconnect attempts.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    /// Consecutive reconnects scheduled since the last successful open.
    pub attempt: u32,
}

/// Decodes one inbound frame. Unknown `type` values yield `Ok(None)`.
pub fn decode_push_frame(text: &str) -> Result<Option<SlotChange>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value.get("type").and_then(|kind| kind.as_str()) {
        Some("slot_change") => serde_json::from_value(value).map(Some),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disable,
}

enum Phase {
    Connect,
    Open(Box<dyn PushStream>),
    Backoff(Instant),
    Parked,
    Shutdown,
}

pub struct PushChannelManager<S> {
    connector: Arc<dyn PushConnector>,
    sink: S,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    status: watch::Sender<ChannelStatus>,
    attempt: u32,
}

impl<S> PushChannelManager<S>
where
    S: Deliver<SlotChange>,
{
    pub fn new(
        connector: Arc<dyn PushConnector>,
        sink: S,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ChannelStatus {
            state: ConnectionState::Closed,
            attempt: 0,
        });
        Self {
            connector,
            sink,
            policy,
            cancel,
            commands,
            command_tx,
            status,
            attempt: 0,
        }
    }

    /// Spawns the channel task and starts connecting right away.
    pub fn spawn(self) -> PushHandle {
        let cancel = self.cancel.clone();
        let commands = self.command_tx.clone();
        let status = self.status.subscribe();
        let join = tokio::spawn(self.run());
        PushHandle {
            commands,
            status,
            cancel: cancel.clone(),
            join: Some(join),
            _guard: cancel.drop_guard(),
        }
    }

    pub async fn run(mut self) {
        let mut phase = Phase::Connect;
        loop {
            phase = match phase {
                Phase::Connect => self.connecting().await,
                Phase::Open(stream) => self.open(stream).await,
                Phase::Backoff(deadline) => self.reconnecting(deadline).await,
                Phase::Parked => self.parked().await,
                Phase::Shutdown => break,
            };
        }
        self.publish(ConnectionState::Closed);
        debug!(target: "sync::push", "push channel stopped");
    }

    async fn connecting(&mut self) -> Phase {
        self.publish(ConnectionState::Connecting);
        let connector = Arc::clone(&self.connector);
        let connect = connector.connect();
        tokio::pin!(connect);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Phase::Shutdown,
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => continue,
                    Some(Command::Disable) => return self.disable(),
                    None => return Phase::Shutdown,
                },
                result = &mut connect => break result,
            }
        };

        match result {
            Ok(stream) => {
                metrics::PUSH_CONNECTS.with_label_values(&["ok"]).inc();
                info!(target: "sync::push", "push channel open");
                self.attempt = 0;
                Phase::Open(stream)
            }
            Err(err) => {
                metrics::PUSH_CONNECTS.with_label_values(&["error"]).inc();
                warn!(target: "sync::push", attempt = self.attempt, error = %err, "push connect failed");
                self.after_close()
            }
        }
    }

    async fn open(&mut self, mut stream: Box<dyn PushStream>) -> Phase {
        self.publish(ConnectionState::Open);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    stream.close().await;
                    return Phase::Shutdown;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => {}
                    Some(Command::Disable) => {
                        stream.close().await;
                        return self.disable();
                    }
                    None => {
                        stream.close().await;
                        return Phase::Shutdown;
                    }
                },
                frame = stream.next_frame() => match frame {
                    Some(Ok(text)) => {
                        if !self.dispatch(&text) {
                            stream.close().await;
                            return Phase::Shutdown;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(target: "sync::push", error = %err, "push socket error");
                        return self.after_close();
                    }
                    None => {
                        info!(target: "sync::push", "push socket closed by peer");
                        return self.after_close();
                    }
                },
            }
        }
    }

    async fn reconnecting(&mut self, deadline: Instant) -> Phase {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Phase::Shutdown,
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => {
                        self.attempt = 0;
                        return Phase::Connect;
                    }
                    Some(Command::Disable) => return self.disable(),
                    None => return Phase::Shutdown,
                },
                _ = tokio::time::sleep_until(deadline) => return Phase::Connect,
            }
        }
    }

    async fn parked(&mut self) -> Phase {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Phase::Shutdown,
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => {
                        info!(target: "sync::push", "manual reconnect");
                        self.attempt = 0;
                        return Phase::Connect;
                    }
                    Some(Command::Disable) => {}
                    None => return Phase::Shutdown,
                },
            }
        }
    }

    /// Socket lost or connect failed: schedule the next attempt or park.
    fn after_close(&mut self) -> Phase {
        self.publish(ConnectionState::Closed);
        if self.attempt >= self.policy.max_attempts {
            warn!(
                target: "sync::push",
                attempts = self.attempt,
                "reconnect attempts exhausted; waiting for manual reconnect"
            );
            self.publish(ConnectionState::Disabled);
            return Phase::Parked;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        self.publish(ConnectionState::Reconnecting);
        debug!(
            target: "sync::push",
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        Phase::Backoff(Instant::now() + delay)
    }

    fn disable(&mut self) -> Phase {
        info!(target: "sync::push", "push channel disabled");
        self.publish(ConnectionState::Disabled);
        Phase::Parked
    }

    fn dispatch(&mut self, text: &str) -> bool {
        match decode_push_frame(text) {
            Ok(Some(change)) => {
                metrics::PUSH_EVENTS.with_label_values(&["slot_change"]).inc();
                self.sink.deliver(change)
            }
            Ok(None) => {
                metrics::PUSH_EVENTS.with_label_values(&["ignored"]).inc();
                debug!(target: "sync::push", "ignoring push frame of unknown type");
                true
            }
            Err(err) => {
                metrics::PUSH_EVENTS.with_label_values(&["malformed"]).inc();
                warn!(target: "sync::push", error = %err, "dropping malformed push frame");
                true
            }
        }
    }

    fn publish(&self, state: ConnectionState) {
        self.status.send_replace(ChannelStatus {
            state,
            attempt: self.attempt,
        });
    }
}

/// Caller side of a spawned push channel. Dropping it tears the channel down.
pub struct PushHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ChannelStatus>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
    _guard: DropGuard,
}

impl PushHandle {
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Connects now unless already open or connecting. Resets the attempt
    /// counter and skips any pending backoff.
    pub fn enable(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub fn reconnect(&self) {
        self.enable();
    }

    /// Cancels a pending reconnect and closes the live socket. Idempotent.
    pub fn disable(&self) {
        let _ = self.commands.send(Command::Disable);
    }

    /// Stops the task and waits until the socket has been released.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(target: "sync::push", error = %err, "push task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use console_sdk::SlotChangeKind;
    use test_timeout::tokio_timeout_test;

    /// Fails every connect and records when each attempt happened.
    #[derive(Default)]
    struct RefusingConnector {
        attempts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl PushConnector for RefusingConnector {
        async fn connect(&self) -> Result<Box<dyn PushStream>, PushError> {
            self.attempts.lock().unwrap().push(Instant::now());
            Err(PushError::Closed("connection refused".into()))
        }
    }

    struct ScriptedStream {
        frames: mpsc::UnboundedReceiver<String>,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl PushStream for ScriptedStream {
        async fn next_frame(&mut self) -> Option<Result<String, PushError>> {
            self.frames.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    /// Hands out pre-built streams in order; refuses once they run out.
    #[derive(Default)]
    struct QueueConnector {
        streams: Mutex<VecDeque<ScriptedStream>>,
        connects: Mutex<u32>,
    }

    impl QueueConnector {
        fn push_stream(&self) -> (mpsc::UnboundedSender<String>, Arc<Mutex<bool>>) {
            let (tx, frames) = mpsc::unbounded_channel();
            let closed = Arc::new(Mutex::new(false));
            self.streams.lock().unwrap().push_back(ScriptedStream {
                frames,
                closed: closed.clone(),
            });
            (tx, closed)
        }
    }

    #[async_trait]
    impl PushConnector for QueueConnector {
        async fn connect(&self) -> Result<Box<dyn PushStream>, PushError> {
            *self.connects.lock().unwrap() += 1;
            match self.streams.lock().unwrap().pop_front() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(PushError::Closed("no stream scripted".into())),
            }
        }
    }

    fn collecting_sink() -> (impl Deliver<SlotChange>, mpsc::UnboundedReceiver<SlotChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (move |change: SlotChange| tx.send(change).is_ok(), rx)
    }

    async fn wait_state(handle: &PushHandle, state: ConnectionState) -> ChannelStatus {
        let mut rx = handle.subscribe();
        let status = *rx.wait_for(|s| s.state == state).await.unwrap();
        status
    }

    fn frame(slot_id: i64, kind: &str) -> String {
        serde_json::json!({
            "type": "slot_change",
            "change_type": kind,
            "slot_id": slot_id,
            "timestamp": "2024-06-01T12:00:00Z",
            "recruiter_id": 3,
        })
        .to_string()
    }

    #[tokio_timeout_test(secs = 10, paused)]
    async fn backoff_schedule_then_parks_and_manual_reconnect_resets() {
        let connector = Arc::new(RefusingConnector::default());
        let (sink, _events) = collecting_sink();
        let handle = PushChannelManager::new(
            connector.clone(),
            sink,
            ReconnectPolicy::default(),
            CancellationToken::new(),
        )
        .spawn();

        let parked = wait_state(&handle, ConnectionState::Disabled).await;
        assert_eq!(parked.attempt, 5);

        let attempts = connector.attempts.lock().unwrap().clone();
        // Initial connect plus five reconnects.
        assert_eq!(attempts.len(), 6);
        let delays: Vec<u128> = attempts
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect();
        assert_eq!(delays, [1_000, 2_000, 4_000, 8_000, 16_000]);

        // Nothing further is scheduled while parked.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts.lock().unwrap().len(), 6);

        let before = Instant::now();
        handle.reconnect();
        wait_state(&handle, ConnectionState::Reconnecting).await;
        let attempts = connector.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 7);
        assert_eq!(attempts[6], before);
        assert_eq!(handle.status().attempt, 1);

        handle.shutdown().await;
    }

    #[tokio_timeout_test(secs = 10)]
    async fn dispatches_in_order_and_skips_unknown_frames() {
        let connector = Arc::new(QueueConnector::default());
        let (frames, _closed) = connector.push_stream();
        let (sink, mut events) = collecting_sink();
        let handle = PushChannelManager::new(
            connector.clone(),
            sink,
            ReconnectPolicy::default(),
            CancellationToken::new(),
        )
        .spawn();

        frames.send(frame(1, "created")).unwrap();
        frames.send(r#"{"type":"presence","user":"x"}"#.into()).unwrap();
        frames.send("not json".into()).unwrap();
        frames.send(frame(2, "deleted")).unwrap();

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.slot_id, 1);
        assert_eq!(first.change_type, SlotChangeKind::Created);
        assert_eq!(second.slot_id, 2);
        assert_eq!(second.change_type, SlotChangeKind::Deleted);
        assert_eq!(handle.status().state, ConnectionState::Open);

        handle.shutdown().await;
    }

    #[tokio_timeout_test(secs = 10, paused)]
    async fn open_resets_attempts_after_peer_close() {
        let connector = Arc::new(QueueConnector::default());
        let (first_frames, _) = connector.push_stream();
        let (second_frames, _) = connector.push_stream();
        let (sink, _events) = collecting_sink();
        let handle = PushChannelManager::new(
            connector.clone(),
            sink,
            ReconnectPolicy::default(),
            CancellationToken::new(),
        )
        .spawn();

        wait_state(&handle, ConnectionState::Open).await;
        drop(first_frames);
        let status = wait_state(&handle, ConnectionState::Reconnecting).await;
        assert_eq!(status.attempt, 1);

        let status = wait_state(&handle, ConnectionState::Open).await;
        assert_eq!(status.attempt, 0);
        assert_eq!(*connector.connects.lock().unwrap(), 2);

        drop(second_frames);
        handle.shutdown().await;
    }

    #[tokio_timeout_test(secs = 10, paused)]
    async fn disable_cancels_pending_reconnect_and_is_idempotent() {
        let connector = Arc::new(RefusingConnector::default());
        let (sink, _events) = collecting_sink();
        let handle = PushChannelManager::new(
            connector.clone(),
            sink,
            ReconnectPolicy::default(),
            CancellationToken::new(),
        )
        .spawn();

        wait_state(&handle, ConnectionState::Reconnecting).await;
        handle.disable();
        handle.disable();
        wait_state(&handle, ConnectionState::Disabled).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts.lock().unwrap().len(), 1);
        assert_eq!(handle.status().state, ConnectionState::Disabled);

        handle.enable();
        wait_state(&handle, ConnectionState::Reconnecting).await;
        assert_eq!(connector.attempts.lock().unwrap().len(), 2);

        handle.shutdown().await;
    }

    #[tokio_timeout_test(secs = 10)]
    async fn disable_closes_live_socket() {
        let connector = Arc::new(QueueConnector::default());
        let (_frames, closed) = connector.push_stream();
        let (sink, _events) = collecting_sink();
        let handle = PushChannelManager::new(
            connector.clone(),
            sink,
            ReconnectPolicy::default(),
            CancellationToken::new(),
        )
        .spawn();

        wait_state(&handle, ConnectionState::Open).await;
        handle.disable();
        wait_state(&handle, ConnectionState::Disabled).await;
        assert!(*closed.lock().unwrap());

        handle.shutdown().await;
    }

    #[test]
    fn decode_ignores_unknown_types() {
        assert_eq!(decode_push_frame(r#"{"type":"typing"}"#).unwrap(), None);
        assert_eq!(decode_push_frame(r#"{"no_type":true}"#).unwrap(), None);
        assert!(decode_push_frame(r#"{"type":"slot_change","slot_id":"x"}"#).is_err());
        let change = decode_push_frame(&frame(4, "updated")).unwrap().unwrap();
        assert_eq!(change.slot_id, 4);
        assert_eq!(change.payload["recruiter_id"], 3);
    }
}
