use crate::error::RpcError;

/// Address of a logical byte stream on the messaging substrate.
///
/// The channel is a URI understood by the substrate, the stream id
/// multiplexes independent ordered streams within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelConfig {
    pub channel: String,
    pub stream_id: i32,
}

impl ChannelConfig {
    pub fn new(channel: impl Into<String>, stream_id: i32) -> Self {
        Self { channel: channel.into(), stream_id }
    }

    /// Shared-memory channel on the local node.
    pub fn ipc(stream_id: i32) -> Self {
        Self::new("aeron:ipc", stream_id)
    }

    /// UDP unicast channel.
    pub fn udp(host: &str, port: u16, stream_id: i32) -> Self {
        Self::new(format!("aeron:udp?endpoint={}:{}", host, port), stream_id)
    }

    /// UDP unicast channel bound to a specific local interface.
    pub fn udp_with_interface(host: &str, port: u16, interface: &str, stream_id: i32) -> Self {
        Self::new(
            format!("aeron:udp?endpoint={}:{}|interface={}", host, port, interface),
            stream_id,
        )
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.channel.is_empty() {
            return Err(RpcError::InvalidConfig("channel must not be empty"));
        }
        if self.stream_id <= 0 {
            return Err(RpcError::InvalidConfig("stream_id must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_uris() {
        assert_eq!(ChannelConfig::ipc(1001).channel, "aeron:ipc");
        assert_eq!(
            ChannelConfig::udp("10.0.0.7", 40123, 7).channel,
            "aeron:udp?endpoint=10.0.0.7:40123"
        );
        assert_eq!(
            ChannelConfig::udp_with_interface("10.0.0.7", 40123, "192.168.1.1", 7).channel,
            "aeron:udp?endpoint=10.0.0.7:40123|interface=192.168.1.1"
        );
    }

    #[test]
    fn test_validate() {
        assert!(ChannelConfig::ipc(1).validate().is_ok());
        assert!(ChannelConfig::new("", 1).validate().is_err());
        assert!(ChannelConfig::ipc(0).validate().is_err());
        assert!(ChannelConfig::ipc(-5).validate().is_err());
    }
}
