pub mod cache;
pub mod server;
pub mod splitter;
pub mod stats;

pub use cache::{CacheStats, DnsCache, DnsQuestion};
pub use server::{DnsHandler, DnsServer, Resolver};
pub use splitter::{DnsSplitter, GeoIpOracle, PrivateNetworkOracle, ServerPool};
pub use stats::{DomainStats, QueryRecord, SortBy, StatsCollector};
