//! Accept task: pulls connections off the TCP listener and hands them to the
//! tick loop over an unbounded channel, so the loop never blocks on accepts.

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Spawns the accept loop. It runs until the receiving side of the channel
/// is dropped, i.e. until the tick loop shuts down.
pub fn spawn_accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<TcpStream>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("accepted connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("could not set TCP_NODELAY for {}: {}", addr, e);
                    }
                    if tx.send(stream).is_err() {
                        info!("tick loop gone, stopping accept task");
                        break;
                    }
                }
                Err(e) => error!("accept failed: {}", e),
            }
        }
    });
}
