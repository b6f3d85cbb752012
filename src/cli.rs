//! Command line and environment configuration.
//!
//! Every stage runs in a container and is configured through environment
//! variables; the flags exist mostly for local runs and tests. One binary,
//! one subcommand per long-running stage.

use std::path::PathBuf;

use clap::{builder::BoolishValueParser, Args, ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "logship",
    about = "Container log collection, transport, and archival pipeline",
    version
)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Tail log files and publish them to the broker.
    Agent(AgentOpts),
    /// Consume broker topics and dump them into aggregated log files.
    Dumper(DumperOpts),
    /// Roll and compress inactive or oversized aggregated files.
    Archiver(ArchiverOpts),
    /// Expire old compressed artifacts and stale rotated files.
    Cleaner(CleanerOpts),
}

#[derive(Args, Debug, Clone)]
pub struct RuntimeOpts {
    /// Emit debug-level logs.
    #[arg(
        long,
        env = "DEBUG",
        default_value_t = false,
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub debug: bool,

    /// Log side effects without performing them.
    #[arg(
        long,
        env = "DRYRUN",
        default_value_t = false,
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AgentOpts {
    /// Root directory of the watched log files.
    #[arg(long, env = "LOG_PATH", default_value = "/var/log/apps")]
    pub log_path: PathBuf,

    /// Broker bootstrap address.
    #[arg(long, env = "KAFKA_ADDR")]
    pub kafka_addr: Option<String>,

    /// Directory rescan period, seconds.
    #[arg(long, env = "SCAN_INTERVAL", default_value_t = 10)]
    pub scan_interval: u64,

    /// Batch and packet payload byte cap.
    #[arg(long, env = "SEND_MAX_SIZE", default_value_t = 10 * 1024)]
    pub send_max_size: usize,

    /// Path of the offset-store file. Defaults to offsets.json under the
    /// log root.
    #[arg(long, env = "OFFSET_FILE_PATH")]
    pub offset_file_path: Option<PathBuf>,

    /// Suffix appended to derived topic names.
    #[arg(long, env = "TOPIC_SUFFIX", default_value = ".v3")]
    pub topic_suffix: String,

    #[command(flatten)]
    pub runtime: RuntimeOpts,
}

#[derive(Args, Debug, Clone)]
pub struct DumperOpts {
    /// Root directory of the aggregated output files.
    #[arg(long, env = "LOG_PATH", default_value = "/var/log/apps")]
    pub log_path: PathBuf,

    /// Broker bootstrap address.
    #[arg(long, env = "KAFKA_ADDR")]
    pub kafka_addr: Option<String>,

    /// Suffix selecting which topics to consume.
    #[arg(long, env = "TOPIC_SUFFIX", default_value = ".v3")]
    pub topic_suffix: String,

    /// Worker pool capacity for message decoding.
    #[arg(long, env = "HANDLER_SIZE", default_value_t = 100)]
    pub handler_size: usize,

    /// Flush and offset-persist period, seconds.
    #[arg(long, env = "SAVE_INTERVAL", default_value_t = 5)]
    pub save_interval: u64,

    /// Reordering window per output file, seconds.
    #[arg(long, env = "MAX_BUFFER_TIME_PERFILE", default_value_t = 60)]
    pub buffer_time: u64,

    /// Buffered record cap per output file.
    #[arg(long, env = "MAX_BUFFER_LENGTH_PERFILE", default_value_t = 100_000)]
    pub buffer_length: usize,

    #[command(flatten)]
    pub runtime: RuntimeOpts,
}

#[derive(Args, Debug, Clone)]
pub struct ArchiverOpts {
    /// Root directory of the aggregated output files.
    #[arg(long, env = "LOG_PATH", default_value = "/var/log/apps")]
    pub log_path: PathBuf,

    /// Age threshold for compressing inactive files, days.
    #[arg(long, env = "EXPIRE", default_value_t = 30)]
    pub expire_days: u64,

    /// Size threshold for rolling an active file, bytes.
    #[arg(long, env = "ARCHIVE_MAX_SIZE", default_value_t = 10 * 1024 * 1024 * 1024)]
    pub max_size: u64,

    #[command(flatten)]
    pub runtime: RuntimeOpts,
}

#[derive(Args, Debug, Clone)]
pub struct CleanerOpts {
    /// Root directory scanned for expirable files.
    #[arg(long, env = "LOG_PATH", default_value = "/var/log/apps")]
    pub log_path: PathBuf,

    /// Age threshold for deleting compressed artifacts, days.
    #[arg(long, env = "EXPIRE", default_value_t = 100)]
    pub expire_days: u64,

    /// Idle threshold for deleting rotated source files, seconds.
    #[arg(long, env = "EXPIRE_TIME", default_value_t = 3600)]
    pub idle_expire_secs: u64,

    /// Scan period, seconds.
    #[arg(long, env = "SCAN_INTERVAL", default_value_t = 3600)]
    pub scan_interval: u64,

    #[command(flatten)]
    pub runtime: RuntimeOpts,
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::{Command, Opts};

    #[test]
    fn agent_defaults() {
        let opts = Opts::parse_from(["logship", "agent"]);
        let Command::Agent(agent) = opts.command else {
            panic!("expected agent subcommand");
        };
        assert_eq!(agent.scan_interval, 10);
        assert_eq!(agent.send_max_size, 10 * 1024);
        assert_eq!(agent.topic_suffix, ".v3");
        assert!(agent.kafka_addr.is_none());
        assert!(!agent.runtime.debug);
    }

    #[test]
    fn dumper_flags_override_defaults() {
        let opts = Opts::parse_from([
            "logship",
            "dumper",
            "--kafka-addr",
            "kafka:9092",
            "--handler-size",
            "8",
            "--debug",
            "--dry-run",
        ]);
        let Command::Dumper(dumper) = opts.command else {
            panic!("expected dumper subcommand");
        };
        assert_eq!(dumper.kafka_addr.as_deref(), Some("kafka:9092"));
        assert_eq!(dumper.handler_size, 8);
        assert!(dumper.runtime.debug);
        assert!(dumper.runtime.dry_run);
    }

    #[test]
    fn boolish_flags_accept_values() {
        let opts = Opts::parse_from(["logship", "cleaner", "--debug", "false"]);
        let Command::Cleaner(cleaner) = opts.command else {
            panic!("expected cleaner subcommand");
        };
        assert!(!cleaner.runtime.debug);
    }
}
