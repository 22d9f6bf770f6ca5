use std::time::Duration;
use anyhow::bail;
use crate::protocol::version::Version;
use crate::transport::scheduler::TrafficClass;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct QueueConfig {
    /// This is the maximum number of messages taken from the queue in a single drain round
    pub weight: usize,

    /// This is the maximum number of messages held in the queue. Enqueueing beyond this
    ///  is rejected as congested, it never blocks.
    pub max_depth: usize,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SchedulerConfig {
    /// indexed by [TrafficClass]
    pub queues: [QueueConfig; TrafficClass::COUNT],
}

impl SchedulerConfig {
    pub fn queue(&self, class: TrafficClass) -> &QueueConfig {
        &self.queues[class.index()]
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for class in TrafficClass::ALL {
            let queue = self.queue(class);
            if queue.weight == 0 {
                bail!("weight of traffic class {:?} must be positive", class);
            }
            if queue.max_depth == 0 {
                bail!("max depth of traffic class {:?} must be positive", class);
            }
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            queues: [
                QueueConfig { weight: 16, max_depth: 64 },   // OAM
                QueueConfig { weight: 32, max_depth: 256 },  // management
                QueueConfig { weight: 16, max_depth: 1024 }, // table mutation
                QueueConfig { weight: 8, max_depth: 1024 },  // packet I/O
            ],
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionConfig {
    /// This is the maximum number of frames dispatched per read-ready event. Input that is
    ///  still buffered after that is processed on a zero-delay timer, giving other sessions
    ///  on the same loop a chance to run.
    pub max_frames_per_read: usize,

    /// Unsupported frames are answered with an error message carrying this many bytes of the
    ///  offending frame (or the whole frame if it is shorter)
    pub error_preview_len: usize,

    /// delay before retrying a drain after the stream reported congestion
    pub congestion_retry_delay: Duration,

    pub scheduler: SchedulerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_frames_per_read: 16,
            error_preview_len: 64,
            congestion_retry_delay: Duration::from_millis(10),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frames_per_read == 0 {
            bail!("max frames per read must be positive");
        }
        if self.error_preview_len == 0 {
            bail!("error preview length must be positive");
        }
        self.scheduler.validate()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReassemblyConfig {
    /// Entries expire this long after their first fragment arrived. This is not extended by
    ///  later fragments.
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            ttl: Duration::from_secs(8),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl ReassemblyConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ttl.is_zero() {
            bail!("reassembly TTL must be positive");
        }
        if self.sweep_interval.is_zero() {
            bail!("reassembly sweep interval must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StreamConfig {
    pub connect_timeout: Duration,

    /// Outbound bytes not yet accepted by the socket are buffered. Writes are rejected
    ///  as 'would block' while the buffer holds more than this.
    pub tx_high_water_mark: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            connect_timeout: Duration::from_secs(5),
            tx_high_water_mark: 256 * 1024,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        if self.tx_high_water_mark == 0 {
            bail!("transmit high water mark must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionConfig {
    /// the protocol revisions offered in the hello exchange
    pub versions: Vec<Version>,

    pub hello_timeout: Duration,

    /// Only passively accepted connections request the peer's features, and they are not
    ///  established before the reply arrives or this timeout expires
    pub features_timeout: Duration,

    /// An echo request is sent this long after the connection was established, and this
    ///  long after each answered echo request
    pub echo_interval: Duration,

    /// the connection is closed if an echo request is not answered within this time
    pub echo_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            versions: vec![Version::V1_0, Version::V1_2, Version::V1_3],
            hello_timeout: Duration::from_secs(5),
            features_timeout: Duration::from_secs(5),
            echo_interval: Duration::from_secs(15),
            echo_timeout: Duration::from_secs(8),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.versions.is_empty() {
            bail!("at least one protocol version must be offered");
        }
        if self.hello_timeout.is_zero() {
            bail!("hello timeout must be positive");
        }
        if self.features_timeout.is_zero() {
            bail!("features timeout must be positive");
        }
        if self.echo_interval.is_zero() {
            bail!("echo interval must be positive");
        }
        if self.echo_timeout.is_zero() {
            bail!("echo timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        SessionConfig::default().validate().unwrap();
        ReassemblyConfig::default().validate().unwrap();
        StreamConfig::default().validate().unwrap();
        ConnectionConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::frames(SessionConfig { max_frames_per_read: 0, ..SessionConfig::default() })]
    #[case::preview(SessionConfig { error_preview_len: 0, ..SessionConfig::default() })]
    #[case::weight({
        let mut config = SessionConfig::default();
        config.scheduler.queues[TrafficClass::TableMutation.index()].weight = 0;
        config
    })]
    #[case::depth({
        let mut config = SessionConfig::default();
        config.scheduler.queues[TrafficClass::Bulk.index()].max_depth = 0;
        config
    })]
    fn test_session_config_invalid(#[case] config: SessionConfig) {
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::ttl(ReassemblyConfig { ttl: Duration::ZERO, ..ReassemblyConfig::default() })]
    #[case::interval(ReassemblyConfig { sweep_interval: Duration::ZERO, ..ReassemblyConfig::default() })]
    fn test_reassembly_config_invalid(#[case] config: ReassemblyConfig) {
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::no_versions(ConnectionConfig { versions: vec![], ..ConnectionConfig::default() })]
    #[case::hello(ConnectionConfig { hello_timeout: Duration::ZERO, ..ConnectionConfig::default() })]
    #[case::features(ConnectionConfig { features_timeout: Duration::ZERO, ..ConnectionConfig::default() })]
    #[case::echo_interval(ConnectionConfig { echo_interval: Duration::ZERO, ..ConnectionConfig::default() })]
    #[case::echo_timeout(ConnectionConfig { echo_timeout: Duration::ZERO, ..ConnectionConfig::default() })]
    fn test_connection_config_invalid(#[case] config: ConnectionConfig) {
        assert!(config.validate().is_err());
    }
}
