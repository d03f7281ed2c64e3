//! Structural validation of a candidate bridge configuration

use std::fmt;

use super::broker::BridgeConfig;
use crate::topic::validate_topic_filter;

/// Why a candidate configuration was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Broker address is empty or malformed
    InvalidAddress {
        index: usize,
        address: String,
        reason: &'static str,
    },
    /// Topic is not a valid MQTT topic filter
    InvalidTopicFilter {
        index: usize,
        filter: String,
        reason: &'static str,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidAddress {
                index,
                address,
                reason,
            } => write!(
                f,
                "invalid broker address '{}' for broker {}: {}",
                address, index, reason
            ),
            ValidationError::InvalidTopicFilter {
                index,
                filter,
                reason,
            } => write!(
                f,
                "invalid topic filter '{}' for broker {}: {}",
                filter, index, reason
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Check every broker of `candidate`, stopping at the first problem
///
/// Does not touch the network; an address that parses is accepted even if
/// nothing listens there.
pub fn validate(candidate: &BridgeConfig) -> Result<(), ValidationError> {
    for (index, broker) in candidate.brokers.iter().enumerate() {
        if let Err(reason) = broker.parse_address() {
            return Err(ValidationError::InvalidAddress {
                index,
                address: broker.address.clone(),
                reason,
            });
        }

        for filter in &broker.topics {
            if let Err(reason) = validate_topic_filter(filter) {
                return Err(ValidationError::InvalidTopicFilter {
                    index,
                    filter: filter.clone(),
                    reason,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use test_case::test_case;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate(&BridgeConfig::default()), Ok(()));
    }

    #[test]
    fn test_empty_broker_list_is_valid() {
        assert_eq!(validate(&BridgeConfig::empty()), Ok(()));
    }

    #[test]
    fn test_empty_address_rejected() {
        let config = BridgeConfig::new(vec![
            BrokerConfig::new("localhost:1883"),
            BrokerConfig::new("   "),
        ]);
        match validate(&config) {
            Err(ValidationError::InvalidAddress { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected InvalidAddress, got {:?}", other),
        }
    }

    #[test_case("sensors/#" ; "multi-level wildcard")]
    #[test_case("sensors/+/temp" ; "single-level wildcard")]
    #[test_case("*" ; "star is a literal filter")]
    #[test_case("$share/group/alerts" ; "shared subscription")]
    fn test_valid_topic(filter: &str) {
        let config = BridgeConfig::new(vec![BrokerConfig::new("h:1883").with_topics([filter])]);
        assert_eq!(validate(&config), Ok(()));
    }

    #[test_case("" ; "empty")]
    #[test_case("a/#/b" ; "hash not last")]
    #[test_case("a+/b" ; "plus inside level")]
    #[test_case("a\0b" ; "null character")]
    fn test_invalid_topic(filter: &str) {
        let config = BridgeConfig::new(vec![
            BrokerConfig::new("h:1883").with_topics(["ok/topic", filter])
        ]);
        match validate(&config) {
            Err(ValidationError::InvalidTopicFilter { index, filter: f, .. }) => {
                assert_eq!(index, 0);
                assert_eq!(f, filter);
            }
            other => panic!("expected InvalidTopicFilter, got {:?}", other),
        }
    }

    #[test]
    fn test_unreachable_address_is_still_valid() {
        let config = BridgeConfig::new(vec![BrokerConfig::new("203.0.113.1:1883")]);
        assert_eq!(validate(&config), Ok(()));
    }
}
