// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use fmq_common_telemetry::{LogFormat, LoggingOptions, init_global_logging, set_panic_hook};
use fmq_queue::{
    CompressionMethod, Message, OpenMode, OpenPosition, QueueBuilder, QueueConfig, QueueReport,
    RecoveryPolicy,
};
use snafu::{ResultExt, Whatever, whatever};
use tracing::{debug, info};

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "fmq",
about = "Inspect and drive file and shared-memory message queues",
author = build_info::AUTHOR,
version = build_info::VERSION,
long_version = build_info::LONG_VERSION)]
struct Cli {
    /// Log filter, e.g. `info` or `warn,fmq_queue=debug`. Defaults to
    /// `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write hourly rotated log files here.
    #[arg(long, global = true)]
    log_dir:   Option<PathBuf>,

    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Stat(StatArgs),
    Dump(DumpArgs),
    Check(CheckArgs),
    Tail(TailArgs),
    Write(WriteArgs),
    Create(CreateArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompressArg {
    Gzip,
    Zstd,
}

impl From<CompressArg> for CompressionMethod {
    fn from(arg: CompressArg) -> Self {
        match arg {
            CompressArg::Gzip => Self::Gzip,
            CompressArg::Zstd => Self::Zstd,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RepairArg {
    Reinitialize,
    Recover,
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Print the status header and occupancy of a queue.
Examples:

fmq stat /data/fmq/radar

")]
struct StatArgs {
    path: String,
}

impl StatArgs {
    fn run(&self) -> Result<(), Whatever> {
        let queue = QueueBuilder::new(&self.path)
            .mode(OpenMode::ReadOnly)
            .build()
            .whatever_context(format!("opening {}", self.path))?;
        let header = queue.status().whatever_context("reading status")?;
        let usage = queue.usage().whatever_context("reading slots")?;

        println!("path:          {}", self.path);
        println!("nslots:        {}", header.nslots);
        println!("buf_size:      {}", header.buf_size);
        println!("youngest id:   {}", header.youngest_id);
        println!("youngest slot: {}", header.youngest_slot);
        println!("oldest slot:   {}", header.oldest_slot);
        println!("last written:  {}", fmq_queue::layout::secs_to_time(header.time_written));
        println!(
            "slots used:    {} ({:.1}%)",
            usage.active_slots,
            usage.slot_fraction() * 100.0
        );
        println!(
            "bytes used:    {} ({:.1}%)",
            usage.bytes_used,
            usage.buffer_fraction() * 100.0
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Dump the header and slot table, including damaged records.
Examples:

fmq dump /data/fmq/radar --all

")]
struct DumpArgs {
    path: String,

    /// Include inactive slots.
    #[arg(long)]
    all: bool,
}

impl DumpArgs {
    fn run(&self) -> Result<(), Whatever> {
        let report = QueueReport::load(&self.path)
            .whatever_context(format!("reading {}", self.path))?
            .with_all_slots(self.all);
        print!("{report}");
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Run the full consistency check. Exits non-zero when the queue is corrupt.
Examples:

fmq check /data/fmq/radar
fmq check /data/fmq/radar --repair recover

")]
struct CheckArgs {
    path: String,

    /// Repair a corrupt queue instead of only reporting it.
    #[arg(long, value_enum)]
    repair: Option<RepairArg>,
}

impl CheckArgs {
    fn run(&self) -> Result<(), Whatever> {
        let Some(repair) = self.repair else {
            let queue = QueueBuilder::new(&self.path)
                .mode(OpenMode::ReadOnly)
                .build()
                .whatever_context(format!("opening {}", self.path))?;
            queue.check().whatever_context(format!("{} is corrupt", self.path))?;
            println!("{}: ok", self.path);
            return Ok(());
        };

        let policy = match repair {
            RepairArg::Reinitialize => RecoveryPolicy::Reinitialize,
            RepairArg::Recover => RecoveryPolicy::Recover,
        };
        if !fmq_queue::device::device_exists(&self.path) {
            whatever!("no queue at {}", self.path);
        }
        // Opening read-write checks and repairs in one go.
        let mut queue = QueueBuilder::new(&self.path)
            .mode(OpenMode::ReadWrite)
            .recovery_policy(policy)
            .build()
            .whatever_context(format!("opening {}", self.path))?;
        let report = match queue.recovery_report() {
            Some(report) => Some(report.clone()),
            None => queue.check_and_repair().whatever_context("repairing")?,
        };
        match report {
            Some(report) => println!("{}: {report}", self.path),
            None => println!("{}: ok", self.path),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Follow a queue, printing one line per message.
Examples:

fmq tail /data/fmq/radar --type 7
fmq tail /data/fmq/radar --from-start --timeout 30s

")]
struct TailArgs {
    path: String,

    /// Only print messages of this type.
    #[arg(long = "type")]
    msg_type: Option<i32>,

    /// Give up after this long without a message.
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Start at the oldest message instead of the newest.
    #[arg(long)]
    from_start: bool,

    /// Print the payload when it is valid UTF-8.
    #[arg(long)]
    payload: bool,
}

impl TailArgs {
    fn run(&self) -> Result<(), Whatever> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
            .whatever_context("installing Ctrl-C handler")?;

        let position = if self.from_start {
            OpenPosition::Start
        } else {
            OpenPosition::End
        };
        let mut queue = QueueBuilder::new(&self.path)
            .mode(OpenMode::BlockingReadOnly)
            .position(position)
            .build()
            .whatever_context(format!("opening {}", self.path))?;

        let slice = Duration::from_millis(200);
        let mut idle = Duration::ZERO;
        while !stop.load(Ordering::Relaxed) {
            match queue
                .read_msg(self.msg_type, Some(slice))
                .whatever_context("reading")?
            {
                Some(msg) => {
                    idle = Duration::ZERO;
                    self.print(&msg);
                }
                None => {
                    idle += slice;
                    if self.timeout.is_some_and(|limit| idle >= limit) {
                        whatever!("no message within {:?}", idle);
                    }
                }
            }
        }
        debug!(path = %self.path, "tail interrupted");
        Ok(())
    }

    fn print(&self, msg: &Message) {
        let mut line = format!(
            "{} id={} slot={} type={} subtype={} len={}",
            msg.time.to_rfc3339(),
            msg.id,
            msg.slot,
            msg.msg_type,
            msg.subtype,
            msg.len()
        );
        if self.payload
            && let Ok(text) = std::str::from_utf8(&msg.payload)
        {
            line.push(' ');
            line.push_str(text);
        }
        println!("{line}");
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Write one message, creating the queue if needed. The payload is the text argument, or the contents of a
file when the argument starts with '@'.
Examples:

fmq write /data/fmq/radar --type 7 --subtype 1 'volume complete'
fmq write /data/fmq/radar --type 2 @scan.bin --compress zstd

")]
struct WriteArgs {
    path: String,

    #[arg(long = "type", default_value_t = 0)]
    msg_type: i32,

    #[arg(long, default_value_t = 0)]
    subtype: i32,

    /// Text payload, or `@file` to read it from a file.
    payload: String,

    #[arg(long, value_enum)]
    compress: Option<CompressArg>,
}

impl WriteArgs {
    fn run(&self) -> Result<(), Whatever> {
        let payload = match self.payload.strip_prefix('@') {
            Some(file) => std::fs::read(file).whatever_context(format!("reading {file}"))?,
            None => self.payload.clone().into_bytes(),
        };

        let mut builder = QueueBuilder::new(&self.path).mode(OpenMode::ReadWrite);
        if let Some(method) = self.compress {
            builder = builder.compress(method.into());
        }
        let mut queue = builder
            .build()
            .whatever_context(format!("opening {}", self.path))?;
        let id = queue
            .write(self.msg_type, self.subtype, &payload)
            .whatever_context("writing message")?;
        info!(path = %self.path, id, len = payload.len(), "message written");
        println!("{id}");
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Create a queue, replacing any queue at the same path.
Examples:

fmq create /data/fmq/radar --slots 2000 --size 50000000
fmq create /dev/shm/radar_shmem_4201 --print-config

")]
struct CreateArgs {
    path: String,

    #[arg(long, default_value_t = 1000)]
    slots: usize,

    /// Buffer size in bytes.
    #[arg(long, default_value_t = 100_000)]
    size: usize,

    /// Print the effective configuration as JSON.
    #[arg(long)]
    print_config: bool,
}

impl CreateArgs {
    fn run(&self) -> Result<(), Whatever> {
        let config = QueueConfig {
            mode: OpenMode::Create,
            num_slots: self.slots,
            buf_size: self.size,
            ..QueueConfig::new(&self.path)
        };
        if self.print_config {
            let json = serde_json::to_string_pretty(&config).whatever_context("encoding config")?;
            println!("{json}");
        }
        let queue = QueueBuilder::from_config(config)
            .build()
            .whatever_context(format!("creating {}", self.path))?;
        let geometry = queue.geometry();
        println!(
            "created {} with {} slots and {} bytes",
            self.path, geometry.nslots, geometry.buf_size
        );
        Ok(())
    }
}

fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();

    let logging = LoggingOptions {
        dir: cli
            .log_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
        level: cli.log_level.clone(),
        log_format: if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
        use_stderr: true,
        ..Default::default()
    };
    let _guards = init_global_logging("fmq", &logging);
    set_panic_hook();

    match &cli.commands {
        Commands::Stat(args) => args.run(),
        Commands::Dump(args) => args.run(),
        Commands::Check(args) => args.run(),
        Commands::Tail(args) => args.run(),
        Commands::Write(args) => args.run(),
        Commands::Create(args) => args.run(),
    }
}
