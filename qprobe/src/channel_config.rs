//! Channel configuration for message passing between agents.
//!
//! Every channel in the pipeline is bounded. A full channel blocks its
//! producer, which keeps memory use predictable when a peer misbehaves:
//! - Topics fan events out to every subscribing agent
//! - Command channels carry point-to-point requests to one agent
//! - Frame requests ask producers for frames fitting a packet budget

use serde::{Deserialize, Serialize};

/// Channel capacity configuration.
///
/// All capacities are expressed as the number of messages that can be buffered.
///
/// # Tuning Guidelines
///
/// - **Topics**: one queue per subscriber. A slow subscriber stalls the
///   publisher, so size for the longest burst one agent may lag behind.
///
/// - **Command channels**: stream writes and sender wake-ups. Wake-ups are
///   sent with `try_send` and coalesce, so a small queue is enough.
///
/// - **Frame queue**: bounds the frames waiting per encryption level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Per-subscriber capacity of every topic.
    ///
    /// Default: 1000
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,

    /// Capacity of agent command channels (stream commands, sender commands).
    ///
    /// Default: 256
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Capacity of each frame producer's request channel.
    ///
    /// Default: 64
    #[serde(default = "default_frame_request_capacity")]
    pub frame_request_capacity: usize,

    /// Frames held by the frame queue before pushes block.
    ///
    /// Default: 1000
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
}

fn default_topic_capacity() -> usize {
    1000
}

fn default_command_capacity() -> usize {
    256
}

fn default_frame_request_capacity() -> usize {
    64
}

fn default_frame_queue_capacity() -> usize {
    1000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            topic_capacity: default_topic_capacity(),
            command_capacity: default_command_capacity(),
            frame_request_capacity: default_frame_request_capacity(),
            frame_queue_capacity: default_frame_queue_capacity(),
        }
    }
}

impl ChannelConfig {
    /// Validate channel configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.topic_capacity < 16 {
            return Err("topic_capacity must be at least 16".to_string());
        }
        if self.command_capacity < 8 {
            return Err("command_capacity must be at least 8".to_string());
        }
        if self.frame_request_capacity < 4 {
            return Err("frame_request_capacity must be at least 4".to_string());
        }
        if self.frame_queue_capacity < 16 {
            return Err("frame_queue_capacity must be at least 16".to_string());
        }

        if self.topic_capacity > 100_000 {
            tracing::warn!(
                capacity = self.topic_capacity,
                "topic_capacity is very large, may use excessive memory"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = ChannelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topic_capacity, 1000);
    }

    #[test]
    fn test_validate_too_small() {
        let config = ChannelConfig {
            topic_capacity: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ChannelConfig {
            frame_request_capacity: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
