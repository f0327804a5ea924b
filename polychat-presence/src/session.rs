//! Per-connection receive and send loops.
//!
//! ```text
//!            ┌──────────────── receive loop ────────────────┐
//! wire ────► │ read (rolling pong_wait deadline)             │
//!            │ size check → normalize → registry.broadcast   │ ──► other members' queues
//!            └───────────────────────┬──────────────────────┘
//!                                    │ exit: leave + close (exactly once)
//!                                    ▼
//!            ┌──────────────── send loop ───────────────────┐
//! queue ───► │ recv → batch pending → write (write_wait)     │ ──► wire
//!            │ tick (ping_period) → ping                     │
//!            │ closed → close frame                          │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! Either loop stopping closes the handle, which wakes the other one.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::config::HubConfig;
use crate::connection::{ConnectionHandle, Outbound};
use crate::error::HubError;
use crate::protocol::normalize;
use crate::registry::RoomRegistry;

/// Join `handle` to its room and run both loops over `transport`.
///
/// The returned task finishes once both loops have exited and the handle
/// has reached `Closed`.
pub fn start<T>(
    registry: Arc<RoomRegistry>,
    handle: Arc<ConnectionHandle>,
    outbound: Outbound,
    transport: T,
    config: Arc<HubConfig>,
) -> JoinHandle<()>
where
    T: Sink<Message, Error = tungstenite::Error>
        + Stream<Item = Result<Message, tungstenite::Error>>
        + Send
        + 'static,
{
    let (sink, stream) = transport.split();
    registry.join(&handle);

    let writer = tokio::spawn(send_loop(handle.clone(), outbound, sink, config.clone()));
    let reader = tokio::spawn(receive_loop(registry, handle.clone(), stream, config));

    tokio::spawn(async move {
        if let Err(e) = writer.await {
            log::error!("Send loop for {} panicked: {e}", handle.id());
        }
        if let Err(e) = reader.await {
            log::error!("Receive loop for {} panicked: {e}", handle.id());
        }
        handle.mark_closed();
        log::debug!("Connection {} ({}) closed", handle.id(), handle.user_id());
    })
}

/// Leaves the room and closes the handle when the receive loop ends,
/// however it ends.
struct SessionCleanup {
    registry: Arc<RoomRegistry>,
    handle: Arc<ConnectionHandle>,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        self.registry.leave(&self.handle);
        self.handle.close();
    }
}

async fn receive_loop<St>(
    registry: Arc<RoomRegistry>,
    handle: Arc<ConnectionHandle>,
    mut stream: St,
    config: Arc<HubConfig>,
) where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let _cleanup = SessionCleanup {
        registry: registry.clone(),
        handle: handle.clone(),
    };

    match run_receive_loop(&registry, &handle, &mut stream, &config).await {
        Ok(()) => log::debug!("Receive loop for userID={} finished", handle.user_id()),
        Err(e) if e.is_protocol_violation() => {
            log::warn!("Protocol violation from userID={}: {e}", handle.user_id());
        }
        Err(HubError::ReadTimeout(wait)) => {
            log::info!(
                "userID={} unresponsive for {wait:?}, disconnecting",
                handle.user_id()
            );
        }
        Err(e) => log::debug!("Receive loop for userID={} ended: {e}", handle.user_id()),
    }
}

/// Read frames until the peer goes away, breaks the protocol, or the
/// handle is closed. Every frame, pongs included, resets the deadline.
pub async fn run_receive_loop<St>(
    registry: &RoomRegistry,
    handle: &ConnectionHandle,
    stream: &mut St,
    config: &HubConfig,
) -> Result<(), HubError>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = handle.closed() => return Ok(()),
            next = tokio::time::timeout(config.pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => return Err(HubError::ReadTimeout(config.pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(_) | Message::Binary(_) => {
                let data = message.into_data();
                // The transport's read limit normally rejects these first
                if data.len() > config.max_frame_size {
                    return Err(HubError::FrameTooLarge {
                        size: data.len(),
                        max: config.max_frame_size,
                    });
                }
                let normalized = normalize(&data);
                // An empty record would vanish between batch delimiters
                if normalized.is_empty() {
                    log::trace!("Dropping blank frame from userID={}", handle.user_id());
                    continue;
                }
                registry.broadcast(&handle.room_id(), Arc::new(normalized));
            }
            Message::Pong(_) => {
                log::trace!("Pong from userID={}", handle.user_id());
            }
            // tungstenite answers pings itself
            Message::Ping(_) | Message::Frame(_) => {}
            Message::Close(_) => return Ok(()),
        }
    }
}

async fn send_loop<Si>(
    handle: Arc<ConnectionHandle>,
    mut outbound: Outbound,
    mut sink: Si,
    config: Arc<HubConfig>,
) where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    if let Err(e) = run_send_loop(&handle, &mut outbound, &mut sink, &config).await {
        log::debug!("Send loop for userID={} ended: {e}", handle.user_id());
    }
    handle.close();
}

/// Drain the outbound queue to the wire and emit heartbeat probes.
///
/// Returns `Ok` after a graceful close frame, `Err` on the first failed
/// or overdue write.
pub async fn run_send_loop<Si>(
    handle: &ConnectionHandle,
    outbound: &mut Outbound,
    sink: &mut Si,
    config: &HubConfig,
) -> Result<(), HubError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let period = config.ping_period();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = handle.closed() => {
                return write_close(sink, config).await;
            }
            frame = outbound.recv() => match frame {
                Some(first) => {
                    let batch = outbound.collect_batch(first);
                    write(sink, batch_message(batch), config).await?;
                }
                None => return write_close(sink, config).await,
            },
            _ = heartbeat.tick() => {
                log::trace!("Ping to userID={}", handle.user_id());
                write(sink, Message::Ping(Default::default()), config).await?;
            }
        }
    }
}

/// Text when the batch is valid UTF-8 (the usual case), binary otherwise.
fn batch_message(batch: Vec<u8>) -> Message {
    match String::from_utf8(batch) {
        Ok(text) => Message::text(text),
        Err(e) => Message::binary(e.into_bytes()),
    }
}

async fn write<Si>(sink: &mut Si, message: Message, config: &HubConfig) -> Result<(), HubError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(config.write_wait, sink.send(message)).await {
        Ok(result) => result.map_err(HubError::from),
        Err(_) => Err(HubError::WriteTimeout(config.write_wait)),
    }
}

/// Best effort: the peer may already be gone.
async fn write_close<Si>(sink: &mut Si, config: &HubConfig) -> Result<(), HubError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    if let Err(e) = write(sink, Message::Close(None), config).await {
        log::trace!("Close frame not delivered: {e}");
    }
    let _ = tokio::time::timeout(config.write_wait, sink.close()).await;
    Ok(())
}
