//! Per-component error taxonomy. Each component returns its own enum;
//! `MitmError` aggregates them for use at `anyhow`-level composition
//! boundaries (the connection handler, the DNS server, `main`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
	#[error("no server in the pool answered")]
	AllServersFailed,
	#[error("upstream query timed out")]
	Timeout,
	#[error("geoip oracle error: {0}")]
	GeoIp(String),
	#[error("malformed dns message: {0}")]
	Malformed(String),
	#[error(transparent)]
	Proto(#[from] hickory_proto::ProtoError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CertError {
	#[error("configuration error: {0}")]
	Configuration(String),
	#[error("the CA key file exists but is in an unsupported format; remove {0} and {1} to regenerate")]
	UnsupportedKeyFormat(String, String),
	#[error("certificate generation failed: {0}")]
	Generation(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum HttpError {
	#[error("malformed http message: {0}")]
	Malformed(String),
	#[error("decompression failed: {0}")]
	Decompression(String),
}

#[derive(Debug, Error)]
pub enum EventBusError {
	#[error("subscriber queue full, event dropped")]
	SubscriberQueueFull,
	#[error("unknown subscriber id")]
	UnknownSubscriber,
}

#[derive(Debug, Error)]
pub enum MitmError {
	#[error(transparent)]
	Dns(#[from] DnsError),
	#[error(transparent)]
	Cert(#[from] CertError),
	#[error(transparent)]
	Http(#[from] HttpError),
	#[error(transparent)]
	EventBus(#[from] EventBusError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}
