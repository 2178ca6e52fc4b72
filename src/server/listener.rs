use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::http::connection::Connection;
use crate::server::Handler;

/// Accept loop over an already-bound listener, one task per connection.
pub async fn serve(
    listener: TcpListener,
    name: &'static str,
    handler: Arc<dyn Handler>,
    idle_timeout: Duration,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::debug!(listener = name, "Accepted connection from {}", peer);

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, handler, idle_timeout);
            if let Err(e) = conn.run().await {
                tracing::error!(listener = name, "Connection error from {}: {}", peer, e);
            }
        });
    }
}
