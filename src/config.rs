use envconfig::Envconfig;

/// Broker connection settings, mirroring `common-kafka::config::KafkaConfig`.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,
}

/// Settings specific to a single consumer group/topic pairing.
#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,
}

/// Settings governing the offset-tracking/commit engine itself (spec §6).
#[derive(Envconfig, Clone, Debug)]
pub struct EngineConfig {
    /// Period of the commit ticker, in seconds.
    #[envconfig(default = "5")]
    pub broker_commit_interval_secs: u64,

    /// Threshold, in seconds, past which the livelock watchdog warns.
    #[envconfig(default = "30")]
    pub broker_commit_livelock_soft_timeout_secs: u64,

    /// If set, force a commit after this many acks.
    pub broker_commit_every: Option<u64>,

    /// If true, `wait_empty` runs on stop; otherwise a single final commit.
    #[envconfig(default = "true")]
    pub stream_wait_empty: bool,
}

impl EngineConfig {
    pub fn commit_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.broker_commit_interval_secs)
    }

    pub fn livelock_soft_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.broker_commit_livelock_soft_timeout_secs)
    }
}
