use std::sync::Arc;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::http::backendtls::BackendTLS;

/// Client-side TLS handshake for an established TCP connection.
pub async fn handshake(
	tls: &BackendTLS,
	server_name: ServerName<'static>,
	tcp: TcpStream,
) -> std::io::Result<TlsStream<TcpStream>> {
	let server_name = tls
		.hostname_override
		.clone()
		.unwrap_or(server_name);
	let connector = TlsConnector::from(Arc::clone(&tls.config));
	connector.connect(server_name, tcp).await
}
