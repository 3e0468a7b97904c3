//! TCP front end: one worker task per connection, all sharing the
//! single engine behind its lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::error::{DbError, Result};
use crate::net::protocol::{
    bulk, integer, Frame, FrameParser, RESP_ERROR, RESP_NOT_FOUND, RESP_OK,
};
use crate::storage::Store;

const READ_BUF_SIZE: usize = 4096;

pub struct Server {
    store: Arc<Store>,
    config: Config,
    active_connections: Arc<AtomicUsize>,
}

impl Server {
    pub fn new(store: Arc<Store>, config: Config) -> Server {
        Server {
            store,
            config,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.listen_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("pagekv listening on {addr}");

        loop {
            let (socket, peer) = listener.accept().await?;

            let current = self.active_connections.load(Ordering::Relaxed);
            if current >= self.config.max_connections {
                tracing::warn!(%peer, current, "connection limit reached, rejecting");
                continue;
            }
            self.active_connections.fetch_add(1, Ordering::Relaxed);
            self.store.metrics().connections.inc();
            tracing::debug!(%peer, "accepted connection");

            let store = self.store.clone();
            let active = self.active_connections.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_conn(socket, &store).await {
                    tracing::warn!(%peer, error = %e, "connection closed with error");
                }
                active.fetch_sub(1, Ordering::Relaxed);
                store.metrics().connections.dec();
            });
        }
    }
}

async fn handle_conn(mut socket: TcpStream, store: &Store) -> Result<()> {
    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        parser.feed(&buf[..n]);

        loop {
            match parser.next_frame() {
                Ok(Some(frame)) => {
                    store.metrics().recv_commands.inc();
                    let reply = execute(store, &frame);
                    socket.write_all(&reply).await?;
                }
                Ok(None) => break,
                // Malformed frame: drop the connection.
                Err(e) => return Err(e),
            }
        }
    }
}

/// Dispatch one command and encode its reply.
fn execute(store: &Store, frame: &Frame) -> Vec<u8> {
    match frame.args[0].as_slice() {
        b"set" if frame.args.len() == 3 => {
            match store.set(&frame.raw, &frame.args[1], &frame.args[2]) {
                Ok(()) => RESP_OK.to_vec(),
                Err(e) => {
                    tracing::error!(error = %e, "set failed");
                    RESP_ERROR.to_vec()
                }
            }
        }
        b"get" if frame.args.len() == 2 => match store.get(&frame.args[1]) {
            Ok(val) => bulk(&val),
            Err(DbError::NotFound) => RESP_NOT_FOUND.to_vec(),
            Err(e) => {
                tracing::error!(error = %e, "get failed");
                RESP_ERROR.to_vec()
            }
        },
        b"del" if frame.args.len() >= 2 => {
            match store.delete(&frame.raw, &frame.args[1..]) {
                Ok(deleted) => integer(deleted.iter().filter(|d| **d).count() as u64),
                Err(e) => {
                    tracing::error!(error = %e, "del failed");
                    RESP_ERROR.to_vec()
                }
            }
        }
        verb => {
            tracing::warn!(verb = %String::from_utf8_lossy(verb), "unsupported command");
            RESP_ERROR.to_vec()
        }
    }
}
