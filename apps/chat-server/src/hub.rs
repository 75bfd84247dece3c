//! Chat hub methods.

use std::sync::Arc;

use hubline_server::{HubContext, HubServer, ServerConfig, ServerError, Target};

/// Creates the server with the chat methods registered on `endpoint`.
pub fn build(config: ServerConfig, endpoint: &str) -> Result<Arc<HubServer>, ServerError> {
    let server = HubServer::new(config);
    server.register_endpoint(endpoint)?;

    server.on_invoke("Hi", |ctx: HubContext, (message,): (String,)| async move {
        tracing::info!(connection_id = ctx.connection_id(), "Hi: {message}");
        Ok::<_, ServerError>(true)
    })?;

    server.on_invoke("Broadcast", |ctx: HubContext, (message,): (String,)| async move {
        tracing::info!(connection_id = ctx.connection_id(), "Broadcast: {message}");
        ctx.push("Receive", (format!("{message} from server"),), Target::All)
    })?;

    server.on_connected(|id| tracing::info!(connection_id = id, "client connected"));
    server.on_disconnected(|id, reason| {
        tracing::info!(connection_id = id, reason = reason.unwrap_or("-"), "client disconnected");
    });

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubline_client::HubConnectionBuilder;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    async fn serve() -> (Arc<HubServer>, String) {
        let config = ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        };
        let server = build(config, "/chat").unwrap();
        let addr = server.start().await.unwrap();
        (server, format!("http://{addr}/chat"))
    }

    #[tokio::test]
    async fn hi_returns_true() {
        let (server, url) = serve().await;
        let conn = HubConnectionBuilder::new(url).build().unwrap();
        conn.start().await.unwrap();

        let ok: bool = conn.invoke("Hi", ("ping",)).await.unwrap();
        assert!(ok);

        conn.stop().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let (server, url) = serve().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut clients = Vec::new();
        for name in ["a", "b"] {
            let conn = HubConnectionBuilder::new(url.clone()).build().unwrap();
            let tx = tx.clone();
            conn.on("Receive", move |(text,): (String,)| {
                let _ = tx.send((name, text));
            });
            conn.start().await.unwrap();
            clients.push(conn);
        }

        clients[0].invoke::<()>("Broadcast", ("hey",)).await.unwrap();

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(
            got,
            vec![
                ("a", "hey from server".to_string()),
                ("b", "hey from server".to_string()),
            ]
        );

        for conn in &clients {
            conn.stop().await;
        }
        server.shutdown();
    }
}
