//! Connection handling and the version handshake.

use crate::codec::{MessageCodec, DEFAULT_MAX_MESSAGE_SIZE};
use crate::message::{NetworkAddress, VersionMessage};
use crate::{NetworkError, NetworkResult, PeerError};
use spv_consensus::params::{
    BLOOM_FILTER_VERSION, MIN_PROTOCOL_VERSION, NO_BLOOM_VERSION, PROTOCOL_VERSION,
    SERVICE_BLOOM_FILTER, SERVICE_FULL_NODE, USER_AGENT,
};
use spv_consensus::ChainParams;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Network magic bytes.
    pub magic: [u8; 4],
    /// Remote port.
    pub port: u16,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Maximum payload size.
    pub max_message_size: usize,
    /// Protocol version we announce.
    pub protocol_version: i32,
    /// Lowest protocol version we accept.
    pub min_protocol_version: i32,
    /// User agent we announce.
    pub user_agent: String,
}

impl ConnectionConfig {
    /// Configuration for a chain.
    pub fn for_chain(params: &ChainParams) -> Self {
        Self {
            magic: params.magic,
            port: params.default_port,
            max_message_size: params.max_block_size as usize,
            ..Self::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            port: 8333,
            connect_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// An established TCP connection with framing.
pub struct PeerConnection {
    /// Framed stream.
    pub framed: Framed<TcpStream, MessageCodec>,
    /// Remote address.
    pub addr: SocketAddr,
    /// Time taken by the TCP connect.
    pub latency: Duration,
}

impl PeerConnection {
    /// Connect to `host` on the configured port.
    #[instrument(skip(config))]
    pub async fn connect(host: &str, config: &ConnectionConfig) -> NetworkResult<Self> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| NetworkError::ConnectionFailed(format!("invalid host {}", host)))?;
        let addr = SocketAddr::new(ip, config.port);

        let started = Instant::now();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout("Connection timeout".to_string()))?
            .map_err(NetworkError::Io)?;
        let latency = started.elapsed();

        debug!(addr = %addr, latency_ms = latency.as_millis() as u64, "Connected");

        let codec = MessageCodec::new(config.magic, config.max_message_size);
        Ok(Self {
            framed: Framed::new(stream, codec),
            addr,
            latency,
        })
    }
}

/// Our `version` message.
pub fn build_version(config: &ConnectionConfig, remote: &SocketAddr, local_best_height: u32) -> VersionMessage {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    VersionMessage {
        protocol_version: config.protocol_version,
        services: 0,
        timestamp,
        recv_address: NetworkAddress::new(remote, 0),
        from_address: NetworkAddress::unspecified(),
        nonce: rand::random(),
        user_agent: config.user_agent.clone(),
        start_height: local_best_height as i32,
        relay: false,
    }
}

/// Whether the peer can serve filtered blocks.
pub fn supports_bloom_filter(version: &VersionMessage) -> bool {
    if version.protocol_version >= NO_BLOOM_VERSION {
        version.services & SERVICE_BLOOM_FILTER != 0
    } else {
        version.protocol_version >= BLOOM_FILTER_VERSION
    }
}

/// Reject peers that cannot help us sync.
pub fn validate_version(
    version: &VersionMessage,
    local_best_height: u32,
    min_protocol_version: i32,
) -> Result<(), PeerError> {
    let reason = if version.start_height <= 0 {
        "Peer last block is not greater than 0".to_string()
    } else if (version.start_height as i64) < local_best_height as i64 {
        format!(
            "Peer has expired blockchain {} vs {}(local)",
            version.start_height, local_best_height
        )
    } else if version.services & SERVICE_FULL_NODE == 0 {
        "Peer does not have a copy of the block chain".to_string()
    } else if !supports_bloom_filter(version) {
        "Peer does not support Bloom Filter".to_string()
    } else if version.protocol_version < min_protocol_version {
        format!(
            "Peer protocol version {} is below {}",
            version.protocol_version, min_protocol_version
        )
    } else {
        return Ok(());
    };

    Err(PeerError::UnsuitablePeerVersion(reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(start_height: i32, services: u64, protocol_version: i32) -> VersionMessage {
        let remote: SocketAddr = "127.0.0.1:18444".parse().unwrap();
        VersionMessage {
            protocol_version,
            services,
            start_height,
            ..build_version(&ConnectionConfig::default(), &remote, 0)
        }
    }

    const GOOD_SERVICES: u64 = SERVICE_FULL_NODE | SERVICE_BLOOM_FILTER;

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.protocol_version, 70014);
        assert_eq!(config.min_protocol_version, 70011);
    }

    #[test]
    fn test_config_for_chain() {
        let params = ChainParams::regtest().unwrap();
        let config = ConnectionConfig::for_chain(&params);
        assert_eq!(config.magic, [0xfa, 0xbf, 0xb5, 0xda]);
        assert_eq!(config.port, 18444);
    }

    #[test]
    fn test_accepts_suitable_peer() {
        assert!(validate_version(&version(100, GOOD_SERVICES, 70015), 50, 70011).is_ok());
        assert!(validate_version(&version(100, GOOD_SERVICES, 70015), 100, 70011).is_ok());
    }

    #[test]
    fn test_rejects_unsuitable_peers() {
        let cases = [
            (version(0, GOOD_SERVICES, 70015), 0),
            (version(-5, GOOD_SERVICES, 70015), 0),
            (version(99, GOOD_SERVICES, 70015), 100),
            (version(100, SERVICE_BLOOM_FILTER, 70015), 0),
            (version(100, SERVICE_FULL_NODE, 70015), 0),
            (version(100, GOOD_SERVICES, 70002), 0),
        ];
        for (v, local) in cases {
            assert!(
                matches!(
                    validate_version(&v, local, 70011),
                    Err(PeerError::UnsuitablePeerVersion(_))
                ),
                "accepted {:?}",
                v
            );
        }
    }

    #[test]
    fn test_bloom_support_by_version() {
        // Before NODE_BLOOM existed every 70000+ peer served filters.
        assert!(supports_bloom_filter(&version(1, SERVICE_FULL_NODE, 70002)));
        assert!(!supports_bloom_filter(&version(1, SERVICE_FULL_NODE, 60002)));
        assert!(!supports_bloom_filter(&version(1, SERVICE_FULL_NODE, 70011)));
        assert!(supports_bloom_filter(&version(1, GOOD_SERVICES, 70011)));
    }

    #[test]
    fn test_our_version() {
        let remote: SocketAddr = "10.1.2.3:8333".parse().unwrap();
        let v = build_version(&ConnectionConfig::default(), &remote, 1234);
        assert_eq!(v.start_height, 1234);
        assert!(!v.relay);
        assert_eq!(v.recv_address.port, 8333);
        assert!(v.timestamp > 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_host() {
        let result = PeerConnection::connect("not-an-ip", &ConnectionConfig::default()).await;
        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
    }
}
