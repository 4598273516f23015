//! The TCP event loop: accepts worker connections, drives the handshake and
//! steady-state sample exchange over the framed wire protocol, and routes
//! every event through one task that owns the `Coordinator` exclusively, so
//! state mutation never races across connections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use super::{Coordinator, Phase};
use crate::error::{CoordinatorError, PipelineError, PipelineResult};
use crate::protocol::{self, Message, WorkerKind};

enum Event {
    Connected(Uuid, mpsc::Sender<Message>, oneshot::Sender<()>),
    Disconnected(Uuid),
    Message(Uuid, Message),
}

/// A connection's outbound channel plus the signal used to close it from
/// outside its own reader/writer tasks. Used to drop exactly one offending
/// connection (duplicate trainer registration) without touching any other
/// session or the process.
struct ConnHandle {
    outbox: mpsc::Sender<Message>,
    close: Option<oneshot::Sender<()>>,
}

type Conns = Arc<Mutex<HashMap<Uuid, ConnHandle>>>;

/// Accept worker connections on `listener` and run the coordinator's event
/// loop against `coordinator` until a fatal coordinator error occurs.
/// Connection-scoped errors (duplicate trainer registration) are absorbed
/// here and never reach the caller. `coordinator` is taken as a shared
/// handle so a caller (a test harness, in particular) can keep a clone and
/// inspect state directly while the loop runs.
pub async fn serve(listener: TcpListener, coordinator: Arc<Mutex<Coordinator>>) -> PipelineResult<()> {
    let conns: Conns = Arc::new(Mutex::new(HashMap::new()));

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);

    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let id = Uuid::new_v4();
                log::info!("worker {id} connected from {peer}");
                tokio::spawn(spawn_connection(id, socket, event_tx.clone()));
            }
        });
    }

    // Single task owns the Coordinator and processes every event serially.
    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Connected(id, sender, close) => {
                coordinator.lock().await.connect_worker(id);
                conns.lock().await.insert(
                    id,
                    ConnHandle {
                        outbox: sender,
                        close: Some(close),
                    },
                );
                // Coordinator initiates the handshake on accept.
                send_to(&conns, id, Message::Ping).await;
                send_to(&conns, id, Message::Hello).await;
            }
            Event::Disconnected(id) => {
                coordinator.lock().await.disconnect_worker(id);
                conns.lock().await.remove(&id);
            }
            Event::Message(id, message) => {
                handle_message(&coordinator, &conns, id, message).await?;
            }
        }

        let outgoing = coordinator.lock().await.schedule_free_workers();
        for (id, message) in outgoing {
            send_to(&conns, id, message).await;
        }

        maybe_drive_training_round(&coordinator, &conns).await?;
    }

    Ok(())
}

async fn spawn_connection(id: Uuid, socket: TcpStream, event_tx: mpsc::Sender<Event>) {
    let (reader_half, writer_half) = socket.into_split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(32);
    let (close_tx, close_rx) = oneshot::channel::<()>();
    if event_tx
        .send(Event::Connected(id, out_tx, close_tx))
        .await
        .is_err()
    {
        return;
    }
    tokio::spawn(writer_task(writer_half, out_rx));
    tokio::spawn(reader_task(id, reader_half, event_tx, close_rx));
}

async fn reader_task(
    id: Uuid,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    event_tx: mpsc::Sender<Event>,
    mut close_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut close_rx => {
                event_tx.send(Event::Disconnected(id)).await.ok();
                return;
            }
            result = protocol::read_message(&mut reader) => {
                match result {
                    Ok(message) => {
                        if event_tx.send(Event::Message(id, message)).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        event_tx.send(Event::Disconnected(id)).await.ok();
                        return;
                    }
                }
            }
        }
    }
}

async fn writer_task(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = out_rx.recv().await {
        if protocol::write_message(&mut writer, &message).await.is_err() {
            return;
        }
    }
}

async fn send_to(conns: &Conns, id: Uuid, message: Message) {
    if let Some(handle) = conns.lock().await.get(&id) {
        handle.outbox.send(message).await.ok();
    }
}

/// Drop exactly one connection: removes its outbox (ending its writer task)
/// and fires its close signal (ending its reader task).
async fn close_connection(conns: &Conns, id: Uuid) {
    if let Some(mut handle) = conns.lock().await.remove(&id) {
        if let Some(close) = handle.close.take() {
            close.send(()).ok();
        }
    }
}

async fn handle_message(
    coordinator: &Arc<Mutex<Coordinator>>,
    conns: &Conns,
    id: Uuid,
    message: Message,
) -> PipelineResult<()> {
    match message {
        Message::Ping => send_to(conns, id, Message::Pong).await,
        Message::Pong => {
            log::debug!("worker {id} round-trip acknowledged");
        }
        Message::Hello => {
            // The coordinator initiates Hello on accept; a worker sending
            // one back is not part of the handshake and needs no reply.
        }
        Message::HelloResponse { kind } => match kind {
            WorkerKind::SelfPlay => {
                coordinator.lock().await.declare_self_play(id);
            }
            WorkerKind::Trainer => {
                let declared = coordinator.lock().await.declare_trainer(id);
                match declared {
                    Ok(()) => {}
                    Err(PipelineError::Coordinator(CoordinatorError::DuplicateTrainer)) => {
                        log::warn!(
                            "worker {id} tried to register as a second trainer; closing its connection"
                        );
                        close_connection(conns, id).await;
                    }
                    Err(other) => return Err(other),
                }
            }
        },
        Message::SelfPlayResponse => {
            let configure = coordinator.lock().await.configure_self_play_worker();
            send_to(conns, id, configure).await;
        }
        Message::Ok { message } if message == "configured" => {
            coordinator.lock().await.mark_configured(id);
        }
        Message::Ok { message } if message == "network_trained" => {
            coordinator.lock().await.ack_training()?;
        }
        Message::RequestSampleResponse {
            sample,
            duplicates_seen,
        } => {
            if duplicates_seen > 0 {
                log::warn!("worker {id} reported {duplicates_seen} duplicate state(s)");
            }
            let newly_added = coordinator
                .lock()
                .await
                .handle_request_sample_response(id, sample);
            if !newly_added {
                log::warn!("dropping inflight duplicate state from worker {id}");
            }
        }
        _ => {}
    }
    Ok(())
}

async fn maybe_drive_training_round(
    coordinator: &Arc<Mutex<Coordinator>>,
    conns: &Conns,
) -> PipelineResult<()> {
    let phase = coordinator.lock().await.phase;
    match phase {
        Phase::Idle => {
            let ready = coordinator.lock().await.ready_to_train();
            if ready {
                coordinator.lock().await.write_generation()?;
            }
        }
        Phase::Writing => {
            let requests = coordinator.lock().await.begin_training()?;
            let trainer = coordinator.lock().await.the_trainer;
            if let Some(trainer_id) = trainer {
                for request in requests {
                    send_to(conns, trainer_id, request).await;
                }
            }
        }
        Phase::Rolling => {
            coordinator.lock().await.roll_generation()?;
        }
        Phase::PostCmds => {
            coordinator.lock().await.finish_post_cmds();
        }
        Phase::Training => {}
    }
    Ok(())
}
