use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::ClientConfig;
use rustls::client::danger::{
	HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};

/// TLS settings for dialing a backend. Part of the connection pool key, so
/// identity is by the underlying config pointer.
#[derive(Clone)]
pub struct BackendTLS {
	pub config: Arc<ClientConfig>,
	pub hostname_override: Option<ServerName<'static>>,
	pub insecure: bool,
}

impl std::fmt::Debug for BackendTLS {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BackendTLS")
			.field("hostname_override", &self.hostname_override)
			.field("insecure", &self.insecure)
			.finish_non_exhaustive()
	}
}

impl PartialEq for BackendTLS {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.config, &other.config)
			&& self.hostname_override == other.hostname_override
	}
}
impl Eq for BackendTLS {}

impl std::hash::Hash for BackendTLS {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		(Arc::as_ptr(&self.config) as usize).hash(state);
		self.hostname_override.hash(state);
	}
}

impl Serialize for BackendTLS {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		use serde::ser::SerializeStruct;
		let mut s = serializer.serialize_struct("backendTLS", 2)?;
		s.serialize_field("insecure", &self.insecure)?;
		s.serialize_field(
			"hostnameOverride",
			&self.hostname_override.as_ref().map(|h| format!("{h:?}")),
		)?;
		s.end()
	}
}

/// Config-file form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalBackendTLS {
	/// PEM bundle of additional trust roots. System roots are used otherwise.
	#[serde(default)]
	pub root: Option<String>,
	#[serde(default)]
	pub insecure: bool,
	#[serde(default)]
	pub hostname: Option<String>,
	#[serde(default)]
	pub alpn: Option<Vec<String>>,
}

impl LocalBackendTLS {
	pub fn build(&self) -> anyhow::Result<BackendTLS> {
		let builder = if self.insecure {
			ClientConfig::builder()
				.dangerous()
				.with_custom_certificate_verifier(Arc::new(InsecureVerifier))
				.with_no_client_auth()
		} else {
			let mut roots = rustls::RootCertStore::empty();
			match &self.root {
				Some(pem) => {
					for cert in
						rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?
					{
						roots.add(cert)?;
					}
				},
				None => {
					let native = rustls_native_certs::load_native_certs();
					for cert in native.certs {
						let _ = roots.add(cert);
					}
				},
			}
			ClientConfig::builder()
				.with_root_certificates(roots)
				.with_no_client_auth()
		};
		let mut config = builder;
		if let Some(alpn) = &self.alpn {
			config.alpn_protocols = alpn.iter().map(|a| a.as_bytes().to_vec()).collect();
		}
		let hostname_override = self
			.hostname
			.as_ref()
			.map(|h| ServerName::try_from(h.clone()))
			.transpose()?;
		Ok(BackendTLS {
			config: Arc::new(config),
			hostname_override,
			insecure: self.insecure,
		})
	}
}

/// The default client TLS config: system trust roots, standard verification.
pub static SYSTEM_TRUST: Lazy<BackendTLS> = Lazy::new(|| {
	LocalBackendTLS::default()
		.build()
		.expect("system trust roots must load")
});

#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		rustls::crypto::ring::default_provider()
			.signature_verification_algorithms
			.supported_schemes()
	}
}
