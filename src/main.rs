mod dry_run;
mod logging;

use anyhow::{Context, Result};
use chihiros_lib::commands::ScheduleEncoding;
use chihiros_lib::decoder::{self, FrameRecord};
use chihiros_lib::frame::{FrameView, check_param_len, params_from_ints, parse_hex_blob};
use chihiros_lib::{
    CommandSequencer, ConnectionEngine, DaySelect, DoseQuantity, EngineConfig, MessageId, WeeklySchedule, WeekdaySet,
    build_frame,
};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use dry_run::DryRunTransport;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};

/// Frame tools and dry-run planner for Chihiros dosing pumps.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file with engine settings (attempts, backoff_ms, idle_timeout_secs)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build one frame and print it as hex
    Encode {
        #[arg(long)]
        cmd: u8,
        #[arg(long)]
        mode: u8,
        /// Comma-separated parameter bytes
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        params: Vec<i64>,
        /// Message id as `hi,lo`
        #[arg(long, value_parser = parse_msg_id, default_value = "0,1")]
        msg_id: MessageId,
    },
    /// Split a hex frame into its fields and classify it
    Inspect {
        /// Frame bytes, spaces allowed
        hex: Vec<String>,
    },
    /// Reconstruct device state from a capture log (`-` reads stdin)
    Decode {
        path: PathBuf,
        /// Print each decoded event as a JSON line instead of config lines
        #[arg(long)]
        raw: bool,
        /// Print the reconstructed state as JSON
        #[arg(long, conflicts_with = "raw")]
        json: bool,
    },
    /// Guess what a bare parameter list encodes
    Guess {
        #[arg(value_delimiter = ',', num_args = 1..)]
        params: Vec<u8>,
    },
    /// Plan an immediate dose
    ManualDose {
        #[arg(long)]
        channel: u8,
        /// Amount in mL, e.g. 12.5
        #[arg(long)]
        ml: DoseQuantity,
        #[command(flatten)]
        target: Target,
    },
    /// Plan a weekly schedule for one channel
    AddSchedule {
        #[arg(long)]
        channel: u8,
        /// Time of day, HH:MM
        #[arg(long, value_parser = parse_time_of_day)]
        at: NaiveTime,
        /// Comma-separated weekdays or `everyday`
        #[arg(long, value_delimiter = ',', default_value = "everyday")]
        days: Vec<DaySelect>,
        /// Daily amount in mL
        #[arg(long)]
        ml: DoseQuantity,
        /// Store the entry disabled
        #[arg(long)]
        disabled: bool,
        /// auto, byte-tenths or hi-lo
        #[arg(long, default_value_t = ScheduleEncoding::Auto)]
        encoding: ScheduleEncoding,
        #[command(flatten)]
        target: Target,
    },
    /// Plan switching a channel to automatic mode
    EnableAuto {
        #[arg(long)]
        channel: u8,
        #[command(flatten)]
        target: Target,
    },
    /// Plan an arbitrary frame, repeated with fresh message ids
    Raw {
        #[arg(long)]
        cmd: u8,
        #[arg(long)]
        mode: u8,
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        params: Vec<i64>,
        #[arg(long, default_value_t = 1)]
        repeats: usize,
        #[command(flatten)]
        target: Target,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Device address shown in logs
    #[arg(long, default_value = "dry-run")]
    address: String,
}

fn parse_msg_id(s: &str) -> Result<MessageId, String> {
    let (hi, lo) = s.split_once(',').ok_or("expected hi,lo")?;
    let byte = |v: &str| v.trim().parse::<u8>().map_err(|e| format!("{v:?}: {e}"));
    Ok(MessageId::new(byte(hi)?, byte(lo)?))
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("expected HH:MM: {e}"))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load engine config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read capture from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read capture {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Encode {
            cmd,
            mode,
            params,
            msg_id,
        } => {
            let params = params_from_ints(&params)?;
            check_param_len(cmd, params.len())?;
            let (frame, used) = build_frame(cmd, mode, msg_id, &params);
            if used != msg_id {
                info!(requested = %msg_id, used = %used, "message id moved past the sentinel");
            }
            println!("{frame}");
            println!("{}", hex::encode(frame.as_bytes()));
        }
        Command::Inspect { hex } => {
            let bytes = parse_hex_blob(&hex.join(" "))?;
            let view = FrameView::from_bytes(&bytes);
            println!("{view}");
            let event = chihiros_lib::decode_frame(&bytes);
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        Command::Decode { path, raw, json } => {
            let text = read_input(&path)?;
            let records: Vec<FrameRecord> = decoder::parse_capture_log(&text);
            info!(records = records.len(), "capture parsed");
            let events = decoder::decode_records(&records);
            if raw {
                for event in &events {
                    println!("{}", serde_json::to_string(event)?);
                }
                return Ok(());
            }
            let state = decoder::build_device_state(&events);
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                for line in decoder::to_config_lines(&state) {
                    println!("{line}");
                }
            }
        }
        Command::Guess { params } => {
            println!("{}", serde_json::to_string(&decoder::guess_param_burst(&params))?);
        }
        Command::ManualDose { channel, ml, target } => {
            let sequencer = dry_run_sequencer(cli.config.as_deref(), &target)?;
            info!(channel, dose = %ml, "planning manual dose");
            let result = sequencer.manual_dose(channel, ml).await;
            finish(&sequencer, result).await?;
        }
        Command::AddSchedule {
            channel,
            at,
            days,
            ml,
            disabled,
            encoding,
            target,
        } => {
            let days = WeekdaySet::encode(&days);
            let schedule = WeeklySchedule {
                channel,
                at,
                days,
                daily_dose: ml,
                enabled: !disabled,
                encoding: Some(encoding),
            };
            let sequencer = dry_run_sequencer(cli.config.as_deref(), &target)?;
            info!(channel, %days, dose = %ml, %encoding, "planning weekly schedule");
            let result = sequencer.add_weekly_schedule(&schedule).await;
            finish(&sequencer, result).await?;
        }
        Command::EnableAuto { channel, target } => {
            let sequencer = dry_run_sequencer(cli.config.as_deref(), &target)?;
            let result = sequencer.enable_auto_mode(channel).await;
            finish(&sequencer, result).await?;
        }
        Command::Raw {
            cmd,
            mode,
            params,
            repeats,
            target,
        } => {
            let params = params_from_ints(&params)?;
            let sequencer = dry_run_sequencer(cli.config.as_deref(), &target)?;
            let result = sequencer.send_raw(cmd, mode, &params, repeats).await;
            finish(&sequencer, result).await?;
        }
    }
    Ok(())
}

fn dry_run_sequencer(config: Option<&Path>, target: &Target) -> Result<CommandSequencer<DryRunTransport>> {
    let config = load_config(config)?;
    let engine = ConnectionEngine::with_config(DryRunTransport::new(target.address.as_str()), config);
    Ok(CommandSequencer::new(engine))
}

/// Close the dry-run session and report the planned frame count.
async fn finish(sequencer: &CommandSequencer<DryRunTransport>, result: chihiros_lib::Result<()>) -> Result<()> {
    let engine = sequencer.engine();
    engine.disconnect().await;
    result.context("Dry run failed")?;
    let written = engine.transport().write_count();
    info!(frames = written, last_msg_id = %engine.current_msg_id(), "dry run complete");
    if written == 0 {
        println!("(no frames)");
    } else {
        println!("{} frame(s), last message id {}", written, engine.current_msg_id());
    }
    Ok(())
}
