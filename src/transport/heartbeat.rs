//! Liveness pings for the controller connection.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Outbound;

/// Default spacing between pings.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Handle to a running heartbeat task.
///
/// The task pings once per interval while the connection is open and ends
/// for good the first time it observes the connection closed.
#[derive(Debug)]
pub struct Heartbeat {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start(outbound: Outbound, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_heartbeat(outbound, interval, shutdown_rx));
        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_heartbeat(
    outbound: Outbound,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // First tick is immediate, skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !outbound.is_open() {
                    break;
                }
                if let Err(e) = outbound.ping() {
                    debug!(error = %e, "Heartbeat ping failed");
                    break;
                }
                trace!("Heartbeat ping sent");
            }
            () = outbound.closed() => break,
            _ = &mut shutdown_rx => break,
        }
    }

    debug!("Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, ConnectionState};
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, watch};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    fn detached_outbound(
        state: ConnectionState,
    ) -> (
        Outbound,
        watch::Sender<ConnectionState>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state);
        (
            Outbound {
                tx,
                state: state_rx,
            },
            state_tx,
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn pings_every_interval_until_closed() {
        let (outbound, state_tx, mut rx) = detached_outbound(ConnectionState::Open);
        let mut heartbeat = Heartbeat::start(outbound, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(35)).await;
        let mut pings = 0;
        while let Ok(message) = rx.try_recv() {
            assert!(matches!(message, Message::Ping(_)));
            pings += 1;
        }
        assert_eq!(pings, 3);

        state_tx.send_replace(ConnectionState::Closed);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!heartbeat.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        heartbeat.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_task() {
        let (outbound, _state_tx, mut rx) = detached_outbound(ConnectionState::Open);
        let mut heartbeat = Heartbeat::start(outbound, Duration::from_secs(10));
        heartbeat.stop().await;
        assert!(!heartbeat.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn controller_observes_pings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut pings = 0;
            while pings < 2 {
                match ws.next().await {
                    Some(Ok(Message::Ping(_))) => pings += 1,
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
            ws.close(None).await.unwrap();
            pings
        });

        let connection = Connection::open(&url, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), 2);
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(5), connection.outbound().closed()).await
        );
        connection.shutdown().await;
    }
}
