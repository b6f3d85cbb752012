//! Broker client construction shared by the agent and the dumper.

use rdkafka::ClientConfig;

/// Consumer group identity; fixed so every dumper replica shares one group.
pub const CONSUMER_GROUP: &str = "group_log_dumper";
/// Dry runs consume under a separate group so they never disturb the real
/// group's broker-side state.
pub const CONSUMER_GROUP_DRYRUN: &str = "group_log_dumper_dryrun";

pub fn producer_config(brokers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "30000");
    config
}

pub fn consumer_config(brokers: &str, dry_run: bool) -> ClientConfig {
    let group = if dry_run {
        CONSUMER_GROUP_DRYRUN
    } else {
        CONSUMER_GROUP
    };
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("group.id", group)
        // Offsets live in the application-owned store; the broker's commit
        // machinery is never used.
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false");
    config
}

#[cfg(test)]
mod test {
    use super::{consumer_config, producer_config};

    #[test]
    fn consumer_disables_auto_commit() {
        let config = consumer_config("kafka:9092", false);
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("group.id"), Some("group_log_dumper"));
    }

    #[test]
    fn dry_run_uses_a_separate_group() {
        let config = consumer_config("kafka:9092", true);
        assert_eq!(config.get("group.id"), Some("group_log_dumper_dryrun"));
    }

    #[test]
    fn producer_sets_bootstrap() {
        let config = producer_config("kafka:9092");
        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
    }
}
