//! Connection driver
//!
//! Runs one connection from handshake to teardown inside its own process:
//! the pre-relay gate with its tick, the relay loop, draining and the
//! bounded wait for the peer to acknowledge the close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::Handle;
use russh::{ChannelId, CryptoVec, Disconnect};
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use tg_core::error::{ConnectionError, GatewayError};

use super::handler::GatewayHandler;
use super::machine::{AbortReason, Action, AuthPolicy, Event, RelayEnd};
use super::{ConnectionContext, ConnectionSession, SharedSession, Signal};
use crate::pty::ExitDisposition;
use crate::relay::{ChannelRelay, OutputPump, OutputStream, PumpEvent};

/// Serve one accepted connection to completion
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
) -> Result<ExitDisposition, GatewayError> {
    let relay = ChannelRelay::new(ctx.child.clone(), ctx.relay.read_buffer_size);
    let session: SharedSession = Arc::new(Mutex::new(ConnectionSession::new(
        AuthPolicy::from(&ctx.auth),
        relay,
    )));
    let (signal_tx, mut signals) = mpsc::channel(256);

    // Registered before any child can exist so no exit is missed
    let mut sigchld = signal(SignalKind::child())?;

    let handler = GatewayHandler::new(
        Arc::clone(&session),
        Arc::clone(&ctx.authenticator),
        signal_tx,
        peer,
    );

    // The handshake spends the same budget as the gate
    let accepted = Instant::now();
    let handshake = tokio::time::timeout(
        ctx.auth.timeout,
        russh::server::run_stream(Arc::clone(&ctx.ssh_config), stream, handler),
    );
    let running = match handshake.await {
        Ok(Ok(running)) => running,
        Ok(Err(e)) => {
            session.lock().await.apply(Event::TransportFailed);
            return Err(ConnectionError::Handshake(e.to_string()).into());
        }
        Err(_) => {
            session.lock().await.apply(Event::TransportFailed);
            return Err(ConnectionError::Handshake(format!(
                "no handshake within {:?}",
                ctx.auth.timeout
            ))
            .into());
        }
    };
    let handle = running.handle();
    tokio::pin!(running);

    session.lock().await.apply(Event::HandshakeComplete);

    // Gate: authentication and channel open, bounded by the policy
    let mut ticker = tokio::time::interval(ctx.auth.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = accepted;
    let mut early_child = None;

    loop {
        tokio::select! {
            result = &mut running => {
                let actions = session.lock().await.apply(Event::TransportFailed);
                let detail = match result {
                    Ok(()) => "peer disconnected".to_string(),
                    Err(e) => e.to_string(),
                };
                tracing::debug!("Transport ended before relay: {}", detail);
                return Err(abort_error(&session, &actions, detail).await);
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let actions = session.lock().await.apply(Event::Tick(now - last_tick));
                last_tick = now;
                if has_abort(&actions) {
                    disconnect(&handle).await;
                    return Err(abort_error(&session, &actions, String::new()).await);
                }
            }
            Some(signal) = signals.recv() => match signal {
                Signal::RelayStarted => break,
                Signal::Abort(reason) => {
                    disconnect(&handle).await;
                    let actions = [Action::Abort(reason)];
                    return Err(abort_error(&session, &actions, String::new()).await);
                }
                Signal::ChildStarted(registration) => early_child = Some(registration),
                Signal::ChannelClosed | Signal::SessionFailed => {}
            },
        }
    }

    let channel = session
        .lock()
        .await
        .channel
        .ok_or_else(|| ConnectionError::Transport("relay started without a channel".into()))?;
    tracing::info!("Relaying on channel {:?}", channel);

    // Relay: no timeout, runs until the child or the channel goes away
    let mut pump: Option<OutputPump> = early_child
        .map(|registration| OutputPump::start(registration, ctx.relay.read_buffer_size));
    let mut child_exited = false;
    let mut exit_deadline: Option<Instant> = None;
    let mut transport_done = false;
    let mut channel_closed = false;

    let end = loop {
        if child_exited {
            if pump.as_ref().map_or(true, OutputPump::is_drained) {
                break RelayEnd::ChildExited;
            }
            // Bound the wait for output still buffered in the PTY
            exit_deadline.get_or_insert_with(|| Instant::now() + ctx.relay.close_timeout);
        }

        tokio::select! {
            result = &mut running, if !transport_done => {
                transport_done = true;
                if let Err(e) = result {
                    tracing::debug!("Transport failed during relay: {}", e);
                }
                break RelayEnd::TransportFailed;
            }
            Some(signal) = signals.recv() => match signal {
                Signal::ChildStarted(registration) => {
                    tracing::debug!("Monitoring output of PID {}", registration.pid);
                    pump = Some(OutputPump::start(registration, ctx.relay.read_buffer_size));
                }
                Signal::ChannelClosed => {
                    channel_closed = true;
                    break RelayEnd::ChannelClosed;
                }
                Signal::SessionFailed => break RelayEnd::SessionFailed,
                Signal::RelayStarted | Signal::Abort(_) => {}
            },
            Some(event) = next_output(&mut pump) => match event {
                PumpEvent::Chunk(chunk) => {
                    let data = CryptoVec::from_slice(&chunk.data);
                    let sent = match chunk.stream {
                        OutputStream::Stdout => handle.data(channel, data).await,
                        OutputStream::Stderr => handle.extended_data(channel, 1, data).await,
                    };
                    if sent.is_err() {
                        tracing::debug!("Channel refused output");
                        break RelayEnd::ChannelClosed;
                    }
                }
                PumpEvent::Closed(stream) => {
                    tracing::debug!("{:?} deregistered", stream);
                    if !child_exited {
                        child_exited = session.lock().await.relay.child_exited();
                    }
                }
            },
            _ = sigchld.recv(), if !child_exited => {
                child_exited = session.lock().await.relay.child_exited();
            }
            _ = sleep_until(exit_deadline) => {
                tracing::debug!("Output still open after child exit; giving up on it");
                break RelayEnd::ChildExited;
            }
        }
    };

    tracing::debug!("Relay ended: {:?}", end);
    session.lock().await.apply(Event::RelayEnded(end));

    // Drain
    if let Some(mut pump) = pump.take() {
        pump.deregister();
        let lingering = pump.shutdown();
        if lingering > 0 {
            tracing::debug!("{} output reader(s) still blocked", lingering);
        }
    }
    let disposition = session.lock().await.relay.finish();
    tracing::info!("Child disposition: {:?}", disposition);

    if !transport_done {
        send_close(&handle, channel, disposition).await;
    }
    session.lock().await.apply(Event::DrainComplete);

    // Close wait
    let acknowledged = transport_done
        || channel_closed
        || wait_for_close(
            &mut running,
            &mut signals,
            ctx.relay.close_timeout,
            ctx.relay.close_poll_interval,
        )
        .await;

    let event = if acknowledged {
        Event::CloseAcknowledged
    } else {
        tracing::debug!("Peer did not acknowledge close in time");
        Event::CloseWaitExpired
    };
    let actions = session.lock().await.apply(event);
    if actions.contains(&Action::Terminate) && !transport_done {
        disconnect(&handle).await;
    }

    Ok(disposition)
}

/// Run a connection on a fresh runtime and return the process exit code.
///
/// Meant to be called in the forked connection process. Reader threads still
/// blocked on the PTY do not hold up the exit.
pub fn run_isolated(stream: std::net::TcpStream, peer: SocketAddr, ctx: ConnectionContext) -> i32 {
    let span = tracing::info_span!("conn", %peer, pid = std::process::id());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(parent: &span, "Failed to build runtime: {}", e);
            return 1;
        }
    };

    let code = runtime.block_on(
        async move {
            if let Err(e) = stream.set_nonblocking(true) {
                tracing::error!("Failed to adopt connection: {}", e);
                return 1;
            }
            let stream = match TcpStream::from_std(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("Failed to adopt connection: {}", e);
                    return 1;
                }
            };

            match serve(stream, peer, ctx).await {
                Ok(disposition) => {
                    tracing::info!("Connection closed ({:?})", disposition);
                    0
                }
                Err(e) => {
                    tracing::info!("Connection dropped: {}", e);
                    1
                }
            }
        }
        .instrument(span),
    );

    runtime.shutdown_background();
    code
}

async fn next_output(pump: &mut Option<OutputPump>) -> Option<PumpEvent> {
    match pump {
        Some(pump) => pump.next().await,
        None => None,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn has_abort(actions: &[Action]) -> bool {
    actions.iter().any(|a| matches!(a, Action::Abort(_)))
}

/// Translate an abort into the error reported for this connection
async fn abort_error(session: &SharedSession, actions: &[Action], detail: String) -> GatewayError {
    let state = session.lock().await.state;
    let reason = actions.iter().find_map(|a| match a {
        Action::Abort(reason) => Some(*reason),
        _ => None,
    });

    let error = match reason {
        Some(AbortReason::HandshakeFailed) => ConnectionError::Handshake(detail),
        Some(AbortReason::AttemptsExhausted) => ConnectionError::AuthExhausted {
            attempts: state.attempts(),
        },
        Some(AbortReason::TimedOut) => ConnectionError::AuthTimedOut(state.waited()),
        Some(AbortReason::TransportFailed) | None => ConnectionError::Transport(detail),
    };
    error.into()
}

/// Report the exit status if there is one, then EOF and close
async fn send_close(handle: &Handle, channel: ChannelId, disposition: ExitDisposition) {
    if let Some(status) = disposition.exit_status() {
        if handle.exit_status_request(channel, status).await.is_err() {
            tracing::debug!("Failed to send exit status");
        }
    }
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

async fn wait_for_close<F>(
    running: &mut std::pin::Pin<&mut F>,
    signals: &mut mpsc::Receiver<Signal>,
    timeout: Duration,
    poll_interval: Duration,
) -> bool
where
    F: std::future::Future,
{
    let mut waited = Duration::ZERO;
    while waited < timeout {
        tokio::select! {
            _ = running.as_mut() => return true,
            Some(Signal::ChannelClosed) = signals.recv() => return true,
            _ = tokio::time::sleep(poll_interval) => waited += poll_interval,
        }
    }
    false
}

async fn disconnect(handle: &Handle) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "Goodbye".into(), "en".into())
        .await
    {
        tracing::debug!("Disconnect failed: {}", e);
    }
}
