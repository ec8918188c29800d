use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use flowgate_core::prelude::*;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};

const CACHE_TTL: Duration = Duration::from_secs(30);

/// A resolver with a small positive cache so per-request lookups of the same
/// backend hostname don't hammer DNS.
pub struct CachedResolver {
	resolver: TokioAsyncResolver,
	cache: Mutex<HashMap<Strng, (IpAddr, Instant)>>,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("resolution failed: {0}")]
	Resolution(#[from] hickory_resolver::error::ResolveError),
	#[error("no addresses for {0}")]
	NoRecords(Strng),
}

impl CachedResolver {
	pub fn new(cfg: Option<(ResolverConfig, ResolverOpts)>) -> CachedResolver {
		let resolver = match cfg {
			Some((config, opts)) => TokioAsyncResolver::tokio(config, opts),
			None => TokioAsyncResolver::tokio_from_system_conf()
				.unwrap_or_else(|_| {
					TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
				}),
		};
		CachedResolver {
			resolver,
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub async fn resolve(&self, host: Strng) -> Result<IpAddr, Error> {
		if let Ok(ip) = host.parse::<IpAddr>() {
			return Ok(ip);
		}
		{
			let cache = self.cache.lock().expect("dns cache");
			if let Some((ip, at)) = cache.get(&host)
				&& at.elapsed() < CACHE_TTL
			{
				return Ok(*ip);
			}
		}
		let answer = self.resolver.lookup_ip(host.as_str()).await?;
		let ip = answer.iter().next().ok_or_else(|| Error::NoRecords(host.clone()))?;
		self
			.cache
			.lock()
			.expect("dns cache")
			.insert(host, (ip, Instant::now()));
		Ok(ip)
	}
}

impl std::fmt::Debug for CachedResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CachedResolver").finish_non_exhaustive()
	}
}
